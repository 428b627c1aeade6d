use crate::history::HistoryManager;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Manage the assistant
#[poise::command(
    slash_command,
    subcommands("setkey", "setmodel", "settings", "clear", "usage")
)]
pub async fn assistant(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set the completion API key (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn setkey(
    ctx: Context<'_>,
    #[description = "The new API key"] new_key: String,
) -> Result<(), Error> {
    ctx.defer_ephemeral().await?;
    ctx.data().db.set_api_key(new_key.trim())?;
    info!("Assistant API key updated by {}", ctx.author().name);
    ctx.say("✅ API key updated.").await?;
    Ok(())
}

/// Set the completion model (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn setmodel(
    ctx: Context<'_>,
    #[description = "The new model identifier"] new_model: String,
) -> Result<(), Error> {
    let new_model = new_model.trim().to_string();
    if new_model.is_empty() {
        ctx.say("❌ Model identifier cannot be empty.").await?;
        return Ok(());
    }
    ctx.data().db.set_model(&new_model)?;
    ctx.say(format!("✅ Model updated to `{}`.", new_model))
        .await?;
    Ok(())
}

/// Show the current assistant settings (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn settings(ctx: Context<'_>) -> Result<(), Error> {
    let db = &ctx.data().db;
    let key_status = if db.api_key()?.is_some() {
        "Set ([REDACTED])"
    } else {
        "Not set"
    };
    let model = db
        .model()?
        .unwrap_or_else(|| format!("{} (default)", ctx.data().config.default_model));

    let embed = serenity::CreateEmbed::new()
        .title("🤖 Assistant Settings")
        .field("API key", key_status, true)
        .field("Model", format!("`{}`", model), true)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Forget the conversation history for this server
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn clear(ctx: Context<'_>) -> Result<(), Error> {
    ctx.defer().await?;

    let key = HistoryManager::conversation_key(
        ctx.guild_id().map(|id| id.get()),
        ctx.channel_id().get(),
    );
    ctx.data().history.clear_conversation(&key).await?;
    ctx.say("✅ Conversation history cleared.").await?;
    Ok(())
}

/// Report how much history this server's conversation uses
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
pub async fn usage(ctx: Context<'_>) -> Result<(), Error> {
    let key = HistoryManager::conversation_key(
        ctx.guild_id().map(|id| id.get()),
        ctx.channel_id().get(),
    );
    let bytes = ctx.data().history.measure_usage(&key).await;
    ctx.say(format!(
        "🧠 Stored history for this conversation: **{}** bytes.",
        bytes
    ))
    .await?;
    Ok(())
}
