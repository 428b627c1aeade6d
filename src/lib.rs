pub mod commands;
pub mod config;
pub mod db;
pub mod history;
pub mod llm;
pub mod reply;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub history: history::HistoryManager,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
