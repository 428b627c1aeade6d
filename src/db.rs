use crate::config::Config;
use rusqlite::{Connection, OptionalExtension, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// One pending write from a history commit. `payload` is the serialized
/// turn list plus the conversation's new oldest sequence number; `None`
/// deletes the row (the conversation was evicted down to nothing).
pub struct ConversationWrite {
    pub key: String,
    pub payload: Option<(String, u64)>,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                conversation_key TEXT PRIMARY KEY,
                history TEXT NOT NULL,
                oldest_seq INTEGER NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS pins (
                guild_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                pinned_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (channel_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_pins_guild ON pins (guild_id);

            CREATE TABLE IF NOT EXISTS word_counts (
                user_id TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Settings (key/value) ---

    pub fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            (key, value),
        )?;
        Ok(())
    }

    pub fn api_key(&self) -> anyhow::Result<Option<String>> {
        self.get_setting("api_key")
    }

    pub fn set_api_key(&self, key: &str) -> anyhow::Result<()> {
        self.set_setting("api_key", key)
    }

    pub fn model(&self) -> anyhow::Result<Option<String>> {
        self.get_setting("model")
    }

    pub fn set_model(&self, model: &str) -> anyhow::Result<()> {
        self.set_setting("model", model)
    }

    /// Next unused turn sequence number, persisted with every history commit.
    pub fn turn_seq(&self) -> anyhow::Result<u64> {
        Ok(self
            .get_setting("turn_seq")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    // --- Conversations ---

    pub fn load_conversation(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let history = conn
            .query_row(
                "SELECT history FROM conversations WHERE conversation_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(history)
    }

    /// Byte size and oldest sequence number of every stored conversation.
    /// Loaded once at startup so the ceiling can be enforced without
    /// reading full histories into memory.
    pub fn conversation_index(&self) -> anyhow::Result<Vec<(String, u64, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_key, length(CAST(history AS BLOB)), oldest_seq
             FROM conversations",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Persists a history commit atomically: every conversation the commit
    /// touched (appends and evictions) plus the sequence counter, in one
    /// transaction. Either all of it lands or none of it does.
    pub fn commit_conversations(
        &self,
        writes: &[ConversationWrite],
        next_seq: u64,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for write in writes {
            match &write.payload {
                Some((history, oldest_seq)) => {
                    tx.execute(
                        "INSERT INTO conversations (conversation_key, history, oldest_seq, updated_at)
                         VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
                         ON CONFLICT(conversation_key)
                         DO UPDATE SET history = ?2, oldest_seq = ?3, updated_at = CURRENT_TIMESTAMP",
                        (&write.key, history, *oldest_seq as i64),
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM conversations WHERE conversation_key = ?1",
                        [&write.key],
                    )?;
                }
            }
        }
        tx.execute(
            "INSERT INTO settings (key, value) VALUES ('turn_seq', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            [next_seq.to_string()],
        )?;
        tx.commit()?;
        debug!("Database: Committed {} conversation write(s)", writes.len());
        Ok(())
    }

    pub fn delete_conversation(&self, key: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM conversations WHERE conversation_key = ?1",
            [key],
        )?;
        Ok(count)
    }

    // --- Pins ---

    /// Returns false if the message was already pinned.
    pub fn add_pin(&self, guild_id: &str, channel_id: &str, message_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT OR IGNORE INTO pins (guild_id, channel_id, message_id) VALUES (?1, ?2, ?3)",
            (guild_id, channel_id, message_id),
        )?;
        Ok(count > 0)
    }

    pub fn remove_pin(&self, channel_id: &str, message_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM pins WHERE channel_id = ?1 AND message_id = ?2",
            (channel_id, message_id),
        )?;
        Ok(count > 0)
    }

    pub fn list_pins(&self, channel_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id FROM pins WHERE channel_id = ?1 ORDER BY pinned_at, message_id",
        )?;
        let rows = stmt.query_map([channel_id], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn clear_pins(&self, channel_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM pins WHERE channel_id = ?1", [channel_id])?;
        Ok(count)
    }

    // --- Word tracker ---

    pub fn tracked_word(&self) -> anyhow::Result<Option<String>> {
        self.get_setting("tracked_word")
    }

    /// Changing the tracked word resets all counts.
    pub fn set_tracked_word(&self, word: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES ('tracked_word', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            [word],
        )?;
        tx.execute("DELETE FROM word_counts", [])?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES ('word_total', '0')
             ON CONFLICT(key) DO UPDATE SET value = '0'",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn increment_word_usage(&self, user_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO word_counts (user_id, count) VALUES (?1, 1)
             ON CONFLICT(user_id) DO UPDATE SET count = count + 1",
            [user_id],
        )?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES ('word_total', '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Per-user counts, highest first.
    pub fn word_usage(&self) -> anyhow::Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT user_id, count FROM word_counts ORDER BY count DESC, user_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn word_total(&self) -> anyhow::Result<u64> {
        Ok(self
            .get_setting("word_total")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}
