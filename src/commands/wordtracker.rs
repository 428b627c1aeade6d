use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use tracing::warn;

/// Counts tracked-word mentions from a regular chat message.
/// Called from the message event handler; bot authors are skipped there.
pub fn track_message(data: &Data, message: &serenity::Message) {
    let tracked = match data.db.tracked_word() {
        Ok(Some(word)) if !word.is_empty() => word,
        Ok(_) => return,
        Err(e) => {
            warn!("Word tracker: failed to read tracked word: {}", e);
            return;
        }
    };

    if !message.content.to_lowercase().contains(&tracked) {
        return;
    }

    if let Err(e) = data
        .db
        .increment_word_usage(&message.author.id.to_string())
    {
        warn!("Word tracker: failed to record usage: {}", e);
    }
}

/// Show who has mentioned the tracked word, ranked
#[poise::command(slash_command)]
pub async fn wordcount(ctx: Context<'_>) -> Result<(), Error> {
    let db = &ctx.data().db;
    let Some(word) = db.tracked_word()? else {
        ctx.say("Tracked word is not set.").await?;
        return Ok(());
    };

    let usage = db.word_usage()?;
    if usage.is_empty() {
        ctx.say(format!("No mentions of '{}' have been recorded.", word))
            .await?;
        return Ok(());
    }

    let mut lines: Vec<String> = usage
        .iter()
        .map(|(user_id, count)| format!("User <@{}> mentioned '{}' {} times.", user_id, word, count))
        .collect();
    lines.push(format!("Total mentions: {}.", db.word_total()?));
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Set a new word to track (Owner only; resets all counts)
#[poise::command(slash_command, owners_only)]
pub async fn settrackedword(
    ctx: Context<'_>,
    #[description = "The word to track"] new_word: String,
) -> Result<(), Error> {
    let word = new_word.trim().to_lowercase();
    if word.is_empty() {
        ctx.say("❌ The tracked word cannot be empty.").await?;
        return Ok(());
    }

    ctx.data().db.set_tracked_word(&word)?;
    ctx.say(format!("✅ The new tracked word is '{}'.", word))
        .await?;
    Ok(())
}
