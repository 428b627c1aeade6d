use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use serenity::model::id::{ChannelId, MessageId};
use tracing::{debug, warn};

/// Custom pin list that bypasses Discord's native pin limit
#[poise::command(
    slash_command,
    subcommands("add", "remove", "list", "clear"),
    guild_only
)]
pub async fn pin(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Add a message to the pin list
#[poise::command(slash_command)]
pub async fn add(
    ctx: Context<'_>,
    #[description = "Message link or ID"] message: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let Some((channel_id, message_id)) = parse_message_ref(&message, ctx.channel_id()) else {
        ctx.say("❌ That doesn't look like a message link or ID.")
            .await?;
        return Ok(());
    };

    ctx.defer().await?;

    // Resolve the message first so dead IDs never enter the list
    let target = match channel_id.message(ctx.serenity_context(), message_id).await {
        Ok(msg) => msg,
        Err(_) => {
            ctx.say("❌ Could not find that message.").await?;
            return Ok(());
        }
    };

    let inserted = ctx.data().db.add_pin(
        &guild_id.to_string(),
        &channel_id.to_string(),
        &message_id.to_string(),
    )?;
    if !inserted {
        ctx.say("That message is already pinned.").await?;
        return Ok(());
    }

    ctx.say(format!("📌 Pinned message: {}", target.link()))
        .await?;
    Ok(())
}

/// Remove a message from the pin list
#[poise::command(slash_command)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Message link or ID"] message: String,
) -> Result<(), Error> {
    let Some((channel_id, message_id)) = parse_message_ref(&message, ctx.channel_id()) else {
        ctx.say("❌ That doesn't look like a message link or ID.")
            .await?;
        return Ok(());
    };

    let removed = ctx
        .data()
        .db
        .remove_pin(&channel_id.to_string(), &message_id.to_string())?;
    if removed {
        ctx.say("Message unpinned.").await?;
    } else {
        ctx.say("That message is not pinned.").await?;
    }
    Ok(())
}

/// List all pinned messages in this channel
#[poise::command(slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let channel_id = ctx.channel_id();
    let message_ids = ctx.data().db.list_pins(&channel_id.to_string())?;

    if message_ids.is_empty() {
        ctx.say("No pinned messages in this channel.").await?;
        return Ok(());
    }

    ctx.defer().await?;

    let mut shown = 0;
    for raw_id in &message_ids {
        let Ok(id) = raw_id.parse::<u64>() else {
            continue;
        };
        let msg = match channel_id
            .message(ctx.serenity_context(), MessageId::new(id))
            .await
        {
            Ok(msg) => msg,
            // Stale entry; the delete listener usually beats us to it
            Err(_) => continue,
        };

        let description = if msg.content.is_empty() {
            "*(No content)*".to_string()
        } else {
            msg.content.clone()
        };
        let embed = serenity::CreateEmbed::new()
            .author(
                serenity::CreateEmbedAuthor::new(msg.author.name.clone())
                    .icon_url(msg.author.face()),
            )
            .description(description)
            .field("Jump to message", msg.link(), false)
            .timestamp(msg.timestamp)
            .color(0x5865F2);

        ctx.send(poise::CreateReply::default().embed(embed)).await?;
        shown += 1;
    }

    if shown == 0 {
        ctx.say("No pinned messages in this channel.").await?;
    }
    Ok(())
}

/// Clear all pins in this channel
#[poise::command(slash_command, required_permissions = "MANAGE_MESSAGES")]
pub async fn clear(ctx: Context<'_>) -> Result<(), Error> {
    let cleared = ctx.data().db.clear_pins(&ctx.channel_id().to_string())?;
    if cleared > 0 {
        ctx.say(format!(
            "All pins in this channel have been cleared ({}).",
            cleared
        ))
        .await?;
    } else {
        ctx.say("No pins to clear.").await?;
    }
    Ok(())
}

/// Drops a pin when the underlying message is deleted.
pub fn handle_message_delete(data: &Data, channel_id: ChannelId, message_id: MessageId) {
    match data
        .db
        .remove_pin(&channel_id.to_string(), &message_id.to_string())
    {
        Ok(true) => debug!(
            "Unpinned deleted message {} in channel {}",
            message_id, channel_id
        ),
        Ok(false) => {}
        Err(e) => warn!("Failed to unpin deleted message {}: {}", message_id, e),
    }
}

/// Accepts a bare message ID (current channel) or a full message link.
fn parse_message_ref(input: &str, current_channel: ChannelId) -> Option<(ChannelId, MessageId)> {
    let input = input.trim();

    if let Ok(id) = input.parse::<u64>() {
        if id == 0 {
            return None;
        }
        return Some((current_channel, MessageId::new(id)));
    }

    // https://discord.com/channels/<guild>/<channel>/<message>
    let mut segments = input
        .trim_end_matches('/')
        .rsplit('/')
        .filter(|s| !s.is_empty());
    let message: u64 = segments.next()?.parse().ok()?;
    let channel: u64 = segments.next()?.parse().ok()?;
    if message == 0 || channel == 0 {
        return None;
    }
    Some((ChannelId::new(channel), MessageId::new(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ids_and_links() {
        let here = ChannelId::new(42);

        assert_eq!(
            parse_message_ref("123456", here),
            Some((here, MessageId::new(123456)))
        );
        assert_eq!(
            parse_message_ref(
                "https://discord.com/channels/1/2/3",
                here
            ),
            Some((ChannelId::new(2), MessageId::new(3)))
        );
        assert_eq!(parse_message_ref("not a message", here), None);
        assert_eq!(parse_message_ref("https://discord.com/channels/1", here), None);
    }
}
