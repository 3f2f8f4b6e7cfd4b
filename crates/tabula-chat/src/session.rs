//! Conversation store: session id to memory handle plus session metadata.
//!
//! The in-memory implementation is a sharded [`DashMap`], so operations on
//! different sessions never contend on one lock.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use tabula_core::types::{MemoryHandle, Mode, SessionId, Timestamp, TokenUsage};

/// How a recorded turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    AwaitingApproval,
    Failed,
}

/// Summary of one turn kept for the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub question: String,
    pub mode: Option<Mode>,
    pub outcome: TurnOutcome,
    /// Generated query, answer excerpt, or error message.
    pub summary: String,
    pub retries: u32,
    pub elapsed_time: f64,
    pub tokens: TokenUsage,
    pub at: Timestamp,
}

/// Everything the store knows about one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub memory: Option<MemoryHandle>,
    pub created_at: Timestamp,
    pub last_active_at: Timestamp,
    pub turn_count: u64,
    pub history: VecDeque<TurnRecord>,
}

impl SessionRecord {
    fn new(session_id: SessionId) -> Self {
        let now = Timestamp::now();
        Self {
            session_id,
            memory: None,
            created_at: now,
            last_active_at: now,
            turn_count: 0,
            history: VecDeque::new(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            turn_count: self.turn_count,
            has_memory: self.memory.is_some(),
        }
    }
}

/// Listing view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub created_at: Timestamp,
    pub last_active_at: Timestamp,
    pub turn_count: u64,
    pub has_memory: bool,
}

/// Storage for per-session conversational state.
///
/// Implementations must be safe under concurrent access. Turns of one
/// session are serialized above this layer.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Return the session's memory handle, creating the session on first
    /// sight and marking it active.
    async fn open(&self, session_id: &SessionId) -> Option<MemoryHandle>;

    async fn get(&self, session_id: &SessionId) -> Option<MemoryHandle>;

    /// Bind a memory handle. Does nothing if the session was deleted.
    async fn set(&self, session_id: &SessionId, memory: MemoryHandle);

    /// Clear the memory handle but keep the session. Returns the cleared handle.
    async fn reset(&self, session_id: &SessionId) -> Option<MemoryHandle>;

    /// Remove the session entirely.
    async fn delete(&self, session_id: &SessionId) -> Option<SessionRecord>;

    /// Append a turn to the session's bounded history.
    async fn record_turn(&self, session_id: &SessionId, turn: TurnRecord);

    async fn session(&self, session_id: &SessionId) -> Option<SessionRecord>;

    /// All sessions, most recently active first.
    async fn list(&self) -> Vec<SessionSummary>;

    /// Remove sessions idle for at least `idle_secs` and return them.
    async fn evict_idle(&self, now: Timestamp, idle_secs: u64) -> Vec<SessionRecord>;

    async fn len(&self) -> usize;

    async fn close(&self) {}
}

/// Process-local conversation store.
pub struct InMemoryConversationStore {
    sessions: DashMap<SessionId, SessionRecord>,
    history_limit: usize,
}

impl InMemoryConversationStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            history_limit,
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn open(&self, session_id: &SessionId) -> Option<MemoryHandle> {
        let mut entry = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionRecord::new(session_id.clone()));
        entry.last_active_at = Timestamp::now();
        entry.memory.clone()
    }

    async fn get(&self, session_id: &SessionId) -> Option<MemoryHandle> {
        self.sessions
            .get(session_id)
            .and_then(|record| record.memory.clone())
    }

    async fn set(&self, session_id: &SessionId, memory: MemoryHandle) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.memory = Some(memory);
            record.last_active_at = Timestamp::now();
        }
    }

    async fn reset(&self, session_id: &SessionId) -> Option<MemoryHandle> {
        self.sessions
            .get_mut(session_id)
            .and_then(|mut record| record.memory.take())
    }

    async fn delete(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.remove(session_id).map(|(_, record)| record)
    }

    async fn record_turn(&self, session_id: &SessionId, turn: TurnRecord) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.turn_count += 1;
            record.last_active_at = Timestamp::now();
            record.history.push_back(turn);
            while record.history.len() > self.history_limit {
                record.history.pop_front();
            }
        }
    }

    async fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|record| record.clone())
    }

    async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        summaries
    }

    async fn evict_idle(&self, now: Timestamp, idle_secs: u64) -> Vec<SessionRecord> {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_active_at.seconds_until(now) >= idle_secs)
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check under the shard lock: a turn may have touched it meanwhile.
        stale
            .into_iter()
            .filter_map(|id| {
                self.sessions
                    .remove_if(&id, |_, record| {
                        record.last_active_at.seconds_until(now) >= idle_secs
                    })
                    .map(|(_, record)| record)
            })
            .collect()
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn turn(question: &str) -> TurnRecord {
        TurnRecord {
            question: question.to_string(),
            mode: Some(Mode::DataQuery),
            outcome: TurnOutcome::Completed,
            summary: "SELECT 1".to_string(),
            retries: 0,
            elapsed_time: 0.1,
            tokens: TokenUsage::default(),
            at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_open_creates_session_without_memory() {
        let store = InMemoryConversationStore::default();
        let id = SessionId::from("s1");
        assert!(store.open(&id).await.is_none());
        assert_eq!(store.len().await, 1);
        assert!(store.session(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = InMemoryConversationStore::default();
        let id = SessionId::from("s1");
        store.open(&id).await;
        store.set(&id, MemoryHandle::new("m1")).await;
        assert_eq!(store.get(&id).await, Some(MemoryHandle::new("m1")));
        store.set(&id, MemoryHandle::new("m2")).await;
        assert_eq!(store.open(&id).await, Some(MemoryHandle::new("m2")));
    }

    #[tokio::test]
    async fn test_set_does_not_resurrect_deleted_session() {
        let store = InMemoryConversationStore::default();
        let id = SessionId::from("gone");
        store.open(&id).await;
        store.delete(&id).await;
        store.set(&id, MemoryHandle::new("m")).await;
        assert!(store.session(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_reset_is_idempotent_and_keeps_session() {
        let store = InMemoryConversationStore::default();
        let id = SessionId::from("s1");
        store.open(&id).await;
        store.set(&id, MemoryHandle::new("m1")).await;

        assert_eq!(store.reset(&id).await, Some(MemoryHandle::new("m1")));
        assert_eq!(store.reset(&id).await, None);
        assert!(store.get(&id).await.is_none());
        assert!(store.session(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_session_operations_are_noops() {
        let store = InMemoryConversationStore::default();
        let id = SessionId::from("never");
        assert!(store.reset(&id).await.is_none());
        assert!(store.delete(&id).await.is_none());
        store.record_turn(&id, turn("q")).await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = InMemoryConversationStore::new(2);
        let id = SessionId::from("s1");
        store.open(&id).await;
        for q in ["a", "b", "c"] {
            store.record_turn(&id, turn(q)).await;
        }
        let record = store.session(&id).await.unwrap();
        assert_eq!(record.turn_count, 3);
        let questions: Vec<&str> = record.history.iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = InMemoryConversationStore::default();
        let old = SessionId::from("old");
        let fresh = SessionId::from("fresh");
        store.open(&old).await;
        store.open(&fresh).await;
        store.sessions.get_mut(&old).unwrap().last_active_at = Timestamp(0);

        let evicted = store.evict_idle(Timestamp::now(), 60).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, old);
        assert!(store.session(&fresh).await.is_some());
        assert!(store.session(&old).await.is_none());
    }

    #[tokio::test]
    async fn test_list_orders_by_activity() {
        let store = InMemoryConversationStore::default();
        store.open(&SessionId::from("a")).await;
        store.open(&SessionId::from("b")).await;
        store
            .sessions
            .get_mut(&SessionId::from("a"))
            .unwrap()
            .last_active_at = Timestamp(1);

        let list = store.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].session_id, SessionId::from("b"));
        assert!(!list[0].has_memory);
    }

    #[tokio::test]
    async fn test_concurrent_sessions() {
        let store = Arc::new(InMemoryConversationStore::default());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = SessionId::new(format!("s{}", i));
                store.open(&id).await;
                store.set(&id, MemoryHandle::new(format!("m{}", i))).await;
                store.get(&id).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(
                handle.await.unwrap(),
                Some(MemoryHandle::new(format!("m{}", i)))
            );
        }
        assert_eq!(store.len().await, 32);
    }
}
