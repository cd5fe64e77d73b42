//! In-memory stores — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use snapclaw_core::error::{MemoryError, SessionError};
use snapclaw_core::memory::{
    DEFAULT_FACTS_CAPACITY, FactsSnapshot, HistoryEntry, MemoryFact, MemoryStore, MergeReport,
};
use snapclaw_core::session::{Session, SessionKey, SessionMode, SessionStore};
use snapclaw_core::turn::Turn;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::SessionLocks;

/// Two-layer memory held in process.
pub struct InMemoryStore {
    facts: RwLock<HashMap<SessionKey, FactsSnapshot>>,
    history: RwLock<HashMap<SessionKey, Vec<HistoryEntry>>>,
    locks: SessionLocks,
    capacity: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FACTS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            facts: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            locks: SessionLocks::new(),
            capacity,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn name(&self) -> &str { "in_memory" }

    async fn upsert_facts(
        &self,
        session: &SessionKey,
        facts: Vec<MemoryFact>,
    ) -> Result<MergeReport, MemoryError> {
        let _guard = self.locks.lock(session).await;
        let mut snapshot = self.load_facts_snapshot(session).await?;
        let report = snapshot.merge(&facts, self.capacity);
        if !report.is_noop() {
            self.facts.write().await.insert(session.clone(), snapshot);
        }
        debug!(session = %session, added = report.added, updated = report.updated, "Merged facts");
        Ok(report)
    }

    async fn append_history(&self, session: &SessionKey, entry: HistoryEntry) -> Result<(), MemoryError> {
        self.history
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn load_facts_snapshot(&self, session: &SessionKey) -> Result<FactsSnapshot, MemoryError> {
        Ok(self.facts.read().await.get(session).cloned().unwrap_or_default())
    }

    async fn load_recent_history(
        &self,
        session: &SessionKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, MemoryError> {
        let history = self.history.read().await;
        let entries = history.get(session).map(Vec::as_slice).unwrap_or(&[]);
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }
}

/// Sessions held in process.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str { "in_memory" }

    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key.clone()))
            .clone())
    }

    async fn append_turn(&self, key: &SessionKey, turn: &Turn) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key.clone()))
            .push_turn(turn.clone());
        Ok(())
    }

    async fn read_metadata(
        &self,
        key: &SessionKey,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SessionError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(key)
            .map(|s| s.metadata.clone())
            .unwrap_or_default())
    }

    async fn write_metadata(
        &self,
        key: &SessionKey,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key.clone()));
        session.metadata.extend(patch);
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_mode(&self, key: &SessionKey, mode: SessionMode) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key.clone()));
        session.mode = mode;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionKey>, SessionError> {
        let mut keys: Vec<SessionKey> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
