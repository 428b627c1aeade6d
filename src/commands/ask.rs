use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::history::{HistoryError, HistoryManager};
use crate::reply::split_message;
use crate::{Context, Error};
use tracing::error;

/// Ask the assistant a question
#[poise::command(slash_command)]
pub async fn ask(
    ctx: Context<'_>,
    #[description = "Your question for the assistant"] question: String,
) -> Result<(), Error> {
    let question = question.trim();
    if question.is_empty() {
        ctx.say("❌ Please ask an actual question.").await?;
        return Ok(());
    }

    ctx.defer().await?;

    let key = HistoryManager::conversation_key(
        ctx.guild_id().map(|id| id.get()),
        ctx.channel_id().get(),
    );

    let reply = match ctx
        .data()
        .history
        .handle_turn(&key, &ctx.author().name, question)
        .await
    {
        Ok(reply) => reply,
        Err(HistoryError::Configuration(_)) => {
            ctx.say("❌ No API key is set. An owner can set one with `/assistant setkey`.")
                .await?;
            return Ok(());
        }
        Err(err) => {
            error!("Assistant error in {}: {}", key, err);
            ctx.say(format!("❌ Assistant error: {}", err)).await?;
            return Ok(());
        }
    };

    for chunk in split_message(&reply, DISCORD_MESSAGE_LIMIT) {
        ctx.say(chunk).await?;
    }

    Ok(())
}
