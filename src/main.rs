use cogsmith::commands::{ask, assistant, pins, restrict, wordtracker};
use cogsmith::config::Config;
use cogsmith::history::{HistoryManager, HistorySettings};
use cogsmith::llm::OpenAiClient;
use cogsmith::Data;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    let discord_token = config.discord_token.clone();

    let mut options = poise::FrameworkOptions {
        commands: vec![
            ask::ask(),
            assistant::assistant(),
            pins::pin(),
            restrict::valleykick(),
            wordtracker::wordcount(),
            wordtracker::settrackedword(),
        ],
        event_handler: |_ctx, event, _framework, data| {
            Box::pin(async move {
                match event {
                    serenity::FullEvent::Message { new_message } => {
                        if !new_message.author.bot {
                            wordtracker::track_message(data, new_message);
                        }
                    }
                    serenity::FullEvent::MessageDelete {
                        channel_id,
                        deleted_message_id,
                        ..
                    } => {
                        pins::handle_message_delete(data, *channel_id, *deleted_message_id);
                    }
                    _ => {}
                }
                Ok(())
            })
        },
        ..Default::default()
    };
    if let Some(owner_id) = config.owner_id {
        options.owners.insert(serenity::UserId::new(owner_id));
    }

    let framework = poise::Framework::builder()
        .options(options)
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                let db = cogsmith::db::Database::new(&config).expect("Failed to open database");
                db.execute_init().expect("Failed to initialize database");

                let client = Arc::new(OpenAiClient::new(&config));
                let history =
                    HistoryManager::new(db.clone(), client, HistorySettings::from_config(&config))
                        .expect("Failed to load conversation index");

                Ok(Data {
                    config,
                    db,
                    history,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
