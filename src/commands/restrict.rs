use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use serenity::model::channel::{PermissionOverwrite, PermissionOverwriteType};
use serenity::model::Permissions;
use std::time::Duration;
use tracing::{error, info};

/// Restrict a member to posting in the designated channel for a while
#[poise::command(
    slash_command,
    required_permissions = "MANAGE_ROLES",
    guild_only
)]
pub async fn valleykick(
    ctx: Context<'_>,
    #[description = "Member to restrict"] member: serenity::User,
    #[description = "How long, e.g. 10s or 2m"] duration: Option<String>,
) -> Result<(), Error> {
    let channel_name = ctx.data().config.restrict_channel_name.clone();

    let delay = match duration {
        Some(raw) => match humantime::parse_duration(raw.trim()) {
            Ok(d) => d,
            Err(_) => {
                ctx.say("❌ Could not parse that duration. Try something like `10s` or `2m`.")
                    .await?;
                return Ok(());
            }
        },
        None => Duration::from_secs(ctx.data().config.restrict_default_secs),
    };

    // Resolve the target channel before the first await; the guild ref is
    // a cache borrow and cannot live across suspension points.
    let channel_id = {
        let guild = ctx.guild().ok_or("Must be run in a guild")?;
        guild
            .channels
            .values()
            .find(|c| c.name == channel_name)
            .map(|c| c.id)
    };
    let Some(channel_id) = channel_id else {
        ctx.say(format!("❌ Channel '{}' not found.", channel_name))
            .await?;
        return Ok(());
    };

    let channel = channel_id
        .to_channel(ctx.serenity_context())
        .await?
        .guild()
        .ok_or("Not a guild channel")?;

    let overwrite = PermissionOverwrite {
        allow: Permissions::SEND_MESSAGES,
        deny: Permissions::empty(),
        kind: PermissionOverwriteType::Member(member.id),
    };
    channel
        .create_permission(ctx.serenity_context(), overwrite)
        .await?;
    info!(
        "Restricted {} to #{} for {:?}",
        member.name, channel.name, delay
    );

    ctx.say(format!(
        "⏳ {} is confined to **#{}** for {}.",
        member.name,
        channel.name,
        humantime::format_duration(delay)
    ))
    .await?;

    // Revert in the background so the interaction answers immediately
    let http = ctx.serenity_context().http.clone();
    let member_name = member.name.clone();
    let member_id = member.id;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match channel
            .delete_permission(&http, PermissionOverwriteType::Member(member_id))
            .await
        {
            Ok(()) => {
                info!("Restriction on {} lifted", member_name);
                let _ = channel
                    .id
                    .say(
                        &http,
                        format!("{} can now post in other channels again.", member_name),
                    )
                    .await;
            }
            Err(e) => error!("Failed to lift restriction on {}: {}", member_name, e),
        }
    });

    Ok(())
}
