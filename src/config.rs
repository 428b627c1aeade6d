use dotenvy::dotenv;
use std::env;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub application_id: u64,
    pub owner_id: Option<u64>,
    pub database_url: String,
    pub completion_api_base: String,
    pub default_model: String,
    pub system_prompt: String,
    /// Turns submitted to the model per request
    pub context_window_turns: usize,
    /// Combined serialized size of all stored histories, in bytes
    pub history_ceiling_bytes: u64,
    pub completion_timeout_secs: u64,
    pub restrict_channel_name: String,
    pub restrict_default_secs: u64,
    pub status_message: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// 10 GiB
const DEFAULT_HISTORY_CEILING_BYTES: u64 = 10 * 1024 * 1024 * 1024;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            application_id: env::var("APPLICATION_ID")
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("APPLICATION_ID must be a valid u64"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/cogsmith.db".to_string()),
            completion_api_base: env::var("COMPLETION_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            default_model: env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            system_prompt: env::var("SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
            context_window_turns: env::var("CONTEXT_WINDOW_TURNS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            history_ceiling_bytes: env::var("HISTORY_CEILING_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_CEILING_BYTES),
            completion_timeout_secs: env::var("COMPLETION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
            restrict_channel_name: env::var("RESTRICT_CHANNEL_NAME")
                .unwrap_or_else(|_| "the-valley".to_string()),
            restrict_default_secs: env::var("RESTRICT_DEFAULT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Ready to assist!".to_string()),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("application_id", &self.application_id)
            .field("owner_id", &self.owner_id)
            .field("database_url", &self.database_url)
            .field("completion_api_base", &self.completion_api_base)
            .field("default_model", &self.default_model)
            .field("system_prompt", &self.system_prompt)
            .field("context_window_turns", &self.context_window_turns)
            .field("history_ceiling_bytes", &self.history_ceiling_bytes)
            .field("completion_timeout_secs", &self.completion_timeout_secs)
            .field("restrict_channel_name", &self.restrict_channel_name)
            .field("restrict_default_secs", &self.restrict_default_secs)
            .field("status_message", &self.status_message)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
