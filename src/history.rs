//! Conversation history management for the assistant.
//!
//! Keeps a per-conversation, append-only list of turns, assembles the
//! bounded context window sent to the completion API, and enforces one
//! global byte ceiling across every stored conversation. Histories are
//! cached read-through from the database and written back in a single
//! transaction per exchange.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{ConversationWrite, Database};
use crate::llm::{CompletionClient, PromptMessage, Role};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("assistant is not configured: {0}")]
    Configuration(&'static str),
    #[error("completion request failed: {0}")]
    Completion(#[source] anyhow::Error),
    #[error("history storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

/// One exchanged message. Immutable once appended; `seq` is globally
/// monotonic so "oldest turn across all conversations" is well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub seq: u64,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct ConversationStats {
    bytes: u64,
    oldest_seq: u64,
}

/// In-memory mirror of the conversation store. Presence of a key in
/// `histories` is the "loaded" marker; `index` covers every persisted
/// conversation, loaded or not, so the ceiling can be checked without
/// pulling full histories in.
struct HistoryState {
    histories: HashMap<String, Vec<Turn>>,
    index: HashMap<String, ConversationStats>,
}

/// Staged changes of one exchange. Built on clones of the cached state
/// and installed only after the database transaction commits, so a failed
/// call never leaves a trace in cache or store.
struct CommitPlan {
    histories: HashMap<String, Vec<Turn>>,
    index: HashMap<String, ConversationStats>,
    dirty: HashSet<String>,
}

impl CommitPlan {
    fn stage(&mut self, key: String, turns: Vec<Turn>) -> Result<(), HistoryError> {
        if turns.is_empty() {
            self.index.remove(&key);
        } else {
            self.index.insert(
                key.clone(),
                ConversationStats {
                    bytes: serialized_len(&turns)?,
                    oldest_seq: turns[0].seq,
                },
            );
        }
        self.histories.insert(key.clone(), turns);
        self.dirty.insert(key);
        Ok(())
    }

    fn writes(&self) -> Result<Vec<ConversationWrite>, HistoryError> {
        let mut writes = Vec::new();
        for key in &self.dirty {
            let Some(turns) = self.histories.get(key) else {
                continue;
            };
            let payload = if turns.is_empty() {
                None
            } else {
                let json = serde_json::to_string(turns)
                    .map_err(|e| HistoryError::Storage(e.into()))?;
                Some((json, turns[0].seq))
            };
            writes.push(ConversationWrite {
                key: key.clone(),
                payload,
            });
        }
        Ok(writes)
    }
}

fn serialized_len(turns: &[Turn]) -> Result<u64, HistoryError> {
    serde_json::to_string(turns)
        .map(|json| json.len() as u64)
        .map_err(|e| HistoryError::Storage(e.into()))
}

#[derive(Clone, Debug)]
pub struct HistorySettings {
    pub ceiling_bytes: u64,
    pub window_turns: usize,
    pub system_prompt: String,
    pub default_model: String,
}

impl HistorySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ceiling_bytes: config.history_ceiling_bytes,
            window_turns: config.context_window_turns,
            system_prompt: config.system_prompt.clone(),
            default_model: config.default_model.clone(),
        }
    }
}

pub struct HistoryManager {
    db: Database,
    client: Arc<dyn CompletionClient>,
    settings: HistorySettings,
    state: AsyncMutex<HistoryState>,
    key_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_seq: AtomicU64,
}

impl HistoryManager {
    pub fn new(
        db: Database,
        client: Arc<dyn CompletionClient>,
        settings: HistorySettings,
    ) -> anyhow::Result<Self> {
        let mut index = HashMap::new();
        for (key, bytes, oldest_seq) in db.conversation_index()? {
            index.insert(key, ConversationStats { bytes, oldest_seq });
        }
        let next_seq = db.turn_seq()?;
        info!(
            "History: {} conversation(s) indexed, next turn seq {}",
            index.len(),
            next_seq
        );

        Ok(Self {
            db,
            client,
            settings,
            state: AsyncMutex::new(HistoryState {
                histories: HashMap::new(),
                index,
            }),
            key_locks: std::sync::Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Conversation scope: one history per guild, falling back to the
    /// channel when there is no guild context (DMs).
    pub fn conversation_key(guild_id: Option<u64>, channel_id: u64) -> String {
        match guild_id {
            Some(guild) => format!("guild:{guild}"),
            None => format!("channel:{channel_id}"),
        }
    }

    /// Runs one exchange: appends `"{sender_label}: {query_text}"` as a user
    /// turn, submits the context window, appends the reply, enforces the
    /// ceiling and persists. At most one exchange per key is in flight at a
    /// time. On any failure the stored history is untouched.
    pub async fn handle_turn(
        &self,
        key: &str,
        sender_label: &str,
        query_text: &str,
    ) -> Result<String, HistoryError> {
        let api_key = self
            .db
            .api_key()
            .map_err(HistoryError::Storage)?
            .ok_or(HistoryError::Configuration("no API key is set"))?;
        let model = self
            .db
            .model()
            .map_err(HistoryError::Storage)?
            .unwrap_or_else(|| self.settings.default_model.clone());

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let user_content = format!("{sender_label}: {query_text}");

        // The pending user turn exists only inside this window until the
        // completion succeeds; dropping the window on failure is the
        // rollback.
        let window = {
            let mut state = self.state.lock().await;
            self.ensure_loaded(&mut state, key)?;
            let turns = state.histories.get(key).cloned().unwrap_or_default();
            self.build_window(&turns, &user_content)
        };

        let reply = self
            .client
            .complete(&api_key, &model, &window)
            .await
            .map_err(HistoryError::Completion)?;

        self.commit_exchange(key, user_content, reply.clone())
            .await?;
        Ok(reply)
    }

    /// Removes the conversation from cache and store. A no-op for unknown
    /// or already-empty keys.
    pub async fn clear_conversation(&self, key: &str) -> Result<(), HistoryError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut state = self.state.lock().await;
        self.db
            .delete_conversation(key)
            .map_err(HistoryError::Storage)?;
        state.index.remove(key);
        state.histories.insert(key.to_string(), Vec::new());
        info!("History: cleared conversation {}", key);
        Ok(())
    }

    /// Serialized size of one conversation in bytes. Pure read.
    pub async fn measure_usage(&self, key: &str) -> u64 {
        let state = self.state.lock().await;
        state.index.get(key).map(|s| s.bytes).unwrap_or(0)
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.key_locks.lock().unwrap();
        locks.entry(key.to_string()).or_default().clone()
    }

    fn ensure_loaded(&self, state: &mut HistoryState, key: &str) -> Result<(), HistoryError> {
        if state.histories.contains_key(key) {
            return Ok(());
        }
        let turns = self.load_turns(key)?;
        state.histories.insert(key.to_string(), turns);
        Ok(())
    }

    fn load_turns(&self, key: &str) -> Result<Vec<Turn>, HistoryError> {
        match self
            .db
            .load_conversation(key)
            .map_err(HistoryError::Storage)?
        {
            Some(json) => serde_json::from_str(&json).map_err(|e| HistoryError::Storage(e.into())),
            None => Ok(Vec::new()),
        }
    }

    /// System prompt plus the last N turns (pending user turn included),
    /// oldest first.
    fn build_window(&self, turns: &[Turn], pending_user: &str) -> Vec<PromptMessage> {
        let keep = self.settings.window_turns.saturating_sub(1);
        let start = turns.len().saturating_sub(keep);

        let mut window = Vec::with_capacity(keep + 2);
        window.push(PromptMessage::new(
            Role::System,
            self.settings.system_prompt.clone(),
        ));
        for turn in &turns[start..] {
            window.push(PromptMessage::new(turn.role, turn.content.clone()));
        }
        window.push(PromptMessage::new(Role::User, pending_user));
        window
    }

    async fn commit_exchange(
        &self,
        key: &str,
        user_content: String,
        reply: String,
    ) -> Result<(), HistoryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, key)?;

        let mut turns = state.histories.get(key).cloned().unwrap_or_default();
        let now = Utc::now().timestamp();
        let user_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        turns.push(Turn {
            seq: user_seq,
            role: Role::User,
            content: user_content,
            created_at: now,
        });
        let assistant_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        turns.push(Turn {
            seq: assistant_seq,
            role: Role::Assistant,
            content: reply,
            created_at: now,
        });
        let retained = turns.len();

        let mut plan = CommitPlan {
            histories: HashMap::new(),
            index: state.index.clone(),
            dirty: HashSet::new(),
        };
        plan.stage(key.to_string(), turns)?;
        self.evict_to_ceiling(&state, &mut plan, assistant_seq)?;

        let writes = plan.writes()?;
        self.db
            .commit_conversations(&writes, self.next_seq.load(Ordering::SeqCst))
            .map_err(HistoryError::Storage)?;

        for (staged_key, staged_turns) in plan.histories {
            state.histories.insert(staged_key, staged_turns);
        }
        state.index = plan.index;
        debug!(
            "History: committed exchange for {} ({} turns retained)",
            key, retained
        );
        Ok(())
    }

    /// Evicts the globally-oldest turn (FIFO across all conversations)
    /// until the combined size fits the ceiling. The turn appended by the
    /// current exchange is never evicted, even if the ceiling cannot be
    /// met without it.
    fn evict_to_ceiling(
        &self,
        state: &HistoryState,
        plan: &mut CommitPlan,
        newest_seq: u64,
    ) -> Result<(), HistoryError> {
        loop {
            let total: u64 = plan.index.values().map(|s| s.bytes).sum();
            if total <= self.settings.ceiling_bytes {
                break;
            }

            let Some((victim_seq, victim_key)) = plan
                .index
                .iter()
                .map(|(key, stats)| (stats.oldest_seq, key.clone()))
                .min()
            else {
                break;
            };
            if victim_seq == newest_seq {
                warn!(
                    "History: ceiling of {} bytes cannot hold the newest turn, keeping it",
                    self.settings.ceiling_bytes
                );
                break;
            }

            if !plan.histories.contains_key(&victim_key) {
                let turns = match state.histories.get(&victim_key) {
                    Some(turns) => turns.clone(),
                    None => self.load_turns(&victim_key)?,
                };
                plan.histories.insert(victim_key.clone(), turns);
            }
            let Some(turns) = plan.histories.get_mut(&victim_key) else {
                break;
            };
            let evicted = turns.remove(0);
            debug!(
                "History: evicted turn {} from {} (over ceiling)",
                evicted.seq, victim_key
            );

            let remaining = turns.clone();
            plan.stage(victim_key, remaining)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct MockClient {
        replies: std::sync::Mutex<VecDeque<Result<String, String>>>,
        windows: std::sync::Mutex<Vec<Vec<PromptMessage>>>,
        delay: Option<Duration>,
    }

    impl MockClient {
        fn scripted(replies: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                windows: std::sync::Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn slow(replies: Vec<Result<String, String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                windows: std::sync::Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        fn windows(&self) -> Vec<Vec<PromptMessage>> {
            self.windows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionClient for MockClient {
        async fn complete(
            &self,
            _api_key: &str,
            _model: &str,
            messages: &[PromptMessage],
        ) -> anyhow::Result<String> {
            self.windows.lock().unwrap().push(messages.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Ok("ok".to_string()),
            }
        }
    }

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db.set_api_key("sk-test").unwrap();
        db
    }

    fn manager(db: &Database, client: Arc<dyn CompletionClient>, ceiling: u64) -> HistoryManager {
        HistoryManager::new(
            db.clone(),
            client,
            HistorySettings {
                ceiling_bytes: ceiling,
                window_turns: 10,
                system_prompt: "You are a helpful assistant.".to_string(),
                default_model: "gpt-3.5-turbo".to_string(),
            },
        )
        .unwrap()
    }

    fn persisted(db: &Database, key: &str) -> Vec<Turn> {
        db.load_conversation(key)
            .unwrap()
            .map(|json| serde_json::from_str(&json).unwrap())
            .unwrap_or_default()
    }

    fn total_stored_bytes(db: &Database) -> u64 {
        db.conversation_index()
            .unwrap()
            .iter()
            .map(|(_, bytes, _)| bytes)
            .sum()
    }

    #[tokio::test]
    async fn turns_persist_as_pairs_in_call_order() {
        let db = test_db();
        let client = MockClient::scripted(vec![
            Ok("r1".to_string()),
            Ok("r2".to_string()),
            Ok("r3".to_string()),
        ]);
        let manager = manager(&db, client, u64::MAX);

        manager.handle_turn("guild:1", "alice", "q1").await.unwrap();
        manager.handle_turn("guild:1", "bob", "q2").await.unwrap();
        manager.handle_turn("guild:1", "alice", "q3").await.unwrap();

        let turns = persisted(&db, "guild:1");
        assert_eq!(turns.len(), 6);
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["alice: q1", "r1", "bob: q2", "r2", "alice: q3", "r3"]
        );
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
        }
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq, "seqs must be increasing");
        }
    }

    #[tokio::test]
    async fn failed_completion_leaves_history_untouched() {
        let db = test_db();
        let client = MockClient::scripted(vec![
            Ok("r1".to_string()),
            Err("boom".to_string()),
            Ok("r2".to_string()),
        ]);
        let manager = manager(&db, client.clone(), u64::MAX);

        manager.handle_turn("guild:1", "alice", "q1").await.unwrap();
        let before = db.load_conversation("guild:1").unwrap().unwrap();
        let usage_before = manager.measure_usage("guild:1").await;

        let err = manager
            .handle_turn("guild:1", "alice", "doomed")
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Completion(_)));

        // Persisted and cached state are byte-identical to before the call
        let after = db.load_conversation("guild:1").unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(manager.measure_usage("guild:1").await, usage_before);

        // The failed call did see its pending user turn in the window
        let windows = client.windows();
        let failed_window = &windows[1];
        assert_eq!(
            failed_window.last().unwrap().content,
            "alice: doomed".to_string()
        );

        // The next exchange continues without any trace of the failure
        manager.handle_turn("guild:1", "alice", "q2").await.unwrap();
        let turns = persisted(&db, "guild:1");
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["alice: q1", "r1", "alice: q2", "r2"]);
    }

    #[tokio::test]
    async fn ceiling_holds_after_every_call() {
        let db = test_db();
        let client = MockClient::scripted(Vec::new());
        let manager = manager(&db, client, 600);

        let filler = "x".repeat(80);
        for i in 0..8 {
            let key = format!("guild:{}", i % 3);
            manager.handle_turn(&key, "alice", &filler).await.unwrap();
            assert!(
                total_stored_bytes(&db) <= 600,
                "ceiling violated after call {}",
                i
            );
        }
    }

    #[tokio::test]
    async fn window_holds_at_most_n_turns_oldest_first() {
        let db = test_db();
        let client = MockClient::scripted(
            (1..=6).map(|i| Ok(format!("r{}", i))).collect(),
        );
        let manager = manager(&db, client.clone(), u64::MAX);

        for i in 1..=6 {
            manager
                .handle_turn("guild:1", "alice", &format!("q{}", i))
                .await
                .unwrap();
        }
        assert_eq!(persisted(&db, "guild:1").len(), 12);

        let windows = client.windows();
        let last = windows.last().unwrap();
        assert_eq!(last[0].role, Role::System);

        let turns: Vec<&PromptMessage> =
            last.iter().filter(|m| m.role != Role::System).collect();
        assert_eq!(turns.len(), 10);
        // Oldest first: window starts at r1 (the 10 most recent of the 11
        // turns that exist once the pending user turn is counted)
        assert_eq!(turns[0].content, "r1");
        assert_eq!(turns.last().unwrap().content, "alice: q6");
    }

    #[tokio::test]
    async fn clear_conversation_is_idempotent() {
        let db = test_db();
        let client = MockClient::scripted(Vec::new());
        let manager = manager(&db, client.clone(), u64::MAX);

        // Unknown key is a no-op, not an error
        manager.clear_conversation("guild:404").await.unwrap();

        manager.handle_turn("guild:1", "alice", "hi").await.unwrap();
        assert!(manager.measure_usage("guild:1").await > 0);

        manager.clear_conversation("guild:1").await.unwrap();
        assert_eq!(manager.measure_usage("guild:1").await, 0);
        assert!(db.load_conversation("guild:1").unwrap().is_none());

        // Clearing again is still fine
        manager.clear_conversation("guild:1").await.unwrap();

        // A fresh exchange starts from an empty window
        manager.handle_turn("guild:1", "alice", "again").await.unwrap();
        let windows = client.windows();
        let last = windows.last().unwrap();
        assert_eq!(last.len(), 2); // system + pending user turn only
    }

    #[tokio::test]
    async fn eviction_takes_oldest_across_conversations() {
        let db = test_db();
        let client = MockClient::scripted(Vec::new());
        let manager = manager(&db, client, 700);

        let filler = "y".repeat(150);
        manager.handle_turn("guild:a", "alice", &filler).await.unwrap();
        manager.handle_turn("guild:a", "alice", &filler).await.unwrap();
        let a_oldest_before = persisted(&db, "guild:a")[0].seq;

        manager.handle_turn("guild:b", "bob", &filler).await.unwrap();

        assert!(total_stored_bytes(&db) <= 700);

        // Conversation A paid for B's append: its oldest turns went first
        let a_turns = persisted(&db, "guild:a");
        assert!(
            a_turns.is_empty() || a_turns[0].seq > a_oldest_before,
            "oldest turn of A should have been evicted"
        );

        // B, which holds the newest turns, is intact
        let b_turns = persisted(&db, "guild:b");
        assert_eq!(b_turns.len(), 2);
        assert_eq!(b_turns[0].content, format!("bob: {}", filler));
    }

    #[tokio::test]
    async fn newest_turn_survives_a_tiny_ceiling() {
        let db = test_db();
        let client = MockClient::scripted(vec![Ok("the reply".to_string())]);
        let manager = manager(&db, client, 10);

        manager.handle_turn("guild:1", "alice", "hello").await.unwrap();

        let turns = persisted(&db, "guild:1");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(turns[0].content, "the reply");
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_key_serialize() {
        let db = test_db();
        let client = MockClient::slow(
            vec![Ok("first".to_string()), Ok("second".to_string())],
            Duration::from_millis(50),
        );
        let manager = Arc::new(manager(&db, client, u64::MAX));

        let m1 = manager.clone();
        let t1 = tokio::spawn(async move { m1.handle_turn("guild:1", "alice", "q-one").await });
        let m2 = manager.clone();
        let t2 = tokio::spawn(async move { m2.handle_turn("guild:1", "bob", "q-two").await });

        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        // Exactly one of the two serial orderings, never interleaved
        let turns = persisted(&db, "guild:1");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].role, Role::User);
        assert_eq!(turns[3].role, Role::Assistant);
        assert_eq!(turns[1].content, "first");
        assert_eq!(turns[3].content, "second");

        let users: Vec<&str> = vec![&turns[0].content, &turns[2].content]
            .into_iter()
            .map(|s| s.as_str())
            .collect();
        assert!(
            users == vec!["alice: q-one", "bob: q-two"]
                || users == vec!["bob: q-two", "alice: q-one"]
        );
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        let client = MockClient::scripted(Vec::new());
        let manager = manager(&db, client.clone(), u64::MAX);

        let err = manager
            .handle_turn("guild:1", "alice", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Configuration(_)));

        // No network call, no store mutation
        assert!(client.windows().is_empty());
        assert!(db.conversation_index().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_survives_a_restart() {
        let db = test_db();
        let client = MockClient::scripted(vec![Ok("r1".to_string())]);
        {
            let manager = manager(&db, client, u64::MAX);
            manager.handle_turn("guild:1", "alice", "q1").await.unwrap();
        }

        // New manager over the same database, as after a process restart
        let client = MockClient::scripted(vec![Ok("r2".to_string())]);
        let manager = manager(&db, client.clone(), u64::MAX);

        assert!(manager.measure_usage("guild:1").await > 0);
        manager.handle_turn("guild:1", "alice", "q2").await.unwrap();

        let windows = client.windows();
        let contents: Vec<&str> = windows[0].iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"alice: q1"), "window: {:?}", contents);
        assert!(contents.contains(&"r1"));

        // Sequence numbers keep increasing across restarts
        let turns = persisted(&db, "guild:1");
        assert_eq!(turns.len(), 4);
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
    }

    #[test]
    fn conversation_key_falls_back_to_channel() {
        assert_eq!(HistoryManager::conversation_key(Some(7), 9), "guild:7");
        assert_eq!(HistoryManager::conversation_key(None, 9), "channel:9");
    }
}
