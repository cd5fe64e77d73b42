//! File-based memory store.
//!
//! Layout under the root directory, one subdirectory per session:
//!
//! ```text
//! <root>/<session>/facts.json     # FactsSnapshot, rewritten atomically
//! <root>/<session>/history.jsonl  # HistoryEntry per line, append-only
//! ```
//!
//! Default root: `~/.snapclaw/memory`

use async_trait::async_trait;
use snapclaw_core::error::MemoryError;
use snapclaw_core::memory::{
    DEFAULT_FACTS_CAPACITY, FactsSnapshot, HistoryEntry, MemoryFact, MemoryStore, MergeReport,
};
use snapclaw_core::session::SessionKey;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::SessionLocks;

const FACTS_FILE: &str = "facts.json";
const HISTORY_FILE: &str = "history.jsonl";

pub struct FileMemoryStore {
    root: PathBuf,
    capacity: usize,
    facts_locks: SessionLocks,
    history_locks: SessionLocks,
}

impl FileMemoryStore {
    pub fn new(root: PathBuf) -> Self {
        Self::with_capacity(root, DEFAULT_FACTS_CAPACITY)
    }

    pub fn with_capacity(root: PathBuf, capacity: usize) -> Self {
        debug!(root = %root.display(), capacity, "File memory store opened");
        Self {
            root,
            capacity,
            facts_locks: SessionLocks::new(),
            history_locks: SessionLocks::new(),
        }
    }

    /// Default path: `~/.snapclaw/memory`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".snapclaw").join("memory")
    }

    fn session_dir(&self, session: &SessionKey) -> PathBuf {
        self.root.join(session.file_stem())
    }

    async fn ensure_dir(dir: &Path) -> Result<(), MemoryError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to create memory directory: {e}")))
    }

    async fn read_snapshot(&self, session: &SessionKey) -> Result<FactsSnapshot, MemoryError> {
        let path = self.session_dir(session).join(FACTS_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FactsSnapshot::default()),
            Err(e) => return Err(MemoryError::Storage(format!("Failed to read facts: {e}"))),
        };
        serde_json::from_str(&content).map_err(|e| MemoryError::CorruptedSnapshot {
            session: session.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write via a temp file and rename so readers never see a partial snapshot.
    async fn write_snapshot(&self, session: &SessionKey, snapshot: &FactsSnapshot) -> Result<(), MemoryError> {
        let dir = self.session_dir(session);
        Self::ensure_dir(&dir).await?;
        let body = serde_json::to_string_pretty(snapshot)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize facts: {e}")))?;
        let tmp = dir.join(format!("{FACTS_FILE}.tmp"));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write facts: {e}")))?;
        tokio::fs::rename(&tmp, dir.join(FACTS_FILE))
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to replace facts: {e}")))
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn upsert_facts(
        &self,
        session: &SessionKey,
        facts: Vec<MemoryFact>,
    ) -> Result<MergeReport, MemoryError> {
        let _guard = self.facts_locks.lock(session).await;
        let mut snapshot = self.read_snapshot(session).await?;
        let report = snapshot.merge(&facts, self.capacity);
        if !report.is_noop() {
            self.write_snapshot(session, &snapshot).await?;
        }
        debug!(
            session = %session,
            added = report.added,
            updated = report.updated,
            rejected = report.rejected,
            evicted = report.evicted.len(),
            "Merged facts"
        );
        Ok(report)
    }

    async fn append_history(&self, session: &SessionKey, entry: HistoryEntry) -> Result<(), MemoryError> {
        let _guard = self.history_locks.lock(session).await;
        let dir = self.session_dir(session);
        Self::ensure_dir(&dir).await?;

        let mut line = serde_json::to_string(&entry)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize history entry: {e}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(HISTORY_FILE))
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open history log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to append history: {e}")))?;
        file.flush()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to flush history: {e}")))
    }

    async fn load_facts_snapshot(&self, session: &SessionKey) -> Result<FactsSnapshot, MemoryError> {
        self.read_snapshot(session).await
    }

    async fn load_recent_history(
        &self,
        session: &SessionKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, MemoryError> {
        let path = self.session_dir(session).join(HISTORY_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::Storage(format!("Failed to read history: {e}"))),
        };

        let entries: Vec<HistoryEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted history entry");
                    None
                }
            })
            .collect();

        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapclaw_core::session::SessionMode;
    use snapclaw_core::turn::{Turn, TurnOutcome};
    use tempfile::TempDir;

    fn key() -> SessionKey {
        SessionKey::new("telegram", "42")
    }

    fn entry(text: &str) -> HistoryEntry {
        let mut turn = Turn::new(key(), SessionMode::Normal, text);
        turn.seal(TurnOutcome::Completed { reply: "ok".into() });
        HistoryEntry::from_turn(&turn)
    }

    #[tokio::test]
    async fn facts_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::new(dir.path().to_path_buf());
        store
            .upsert_facts(&key(), vec![MemoryFact::new("User prefers Rust", 0.8)])
            .await
            .unwrap();

        assert!(dir.path().join("telegram_42").join("facts.json").exists());

        let reopened = FileMemoryStore::new(dir.path().to_path_buf());
        let snap = reopened.load_facts_snapshot(&key()).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.facts[0].text, "User prefers Rust");
    }

    #[tokio::test]
    async fn capacity_is_enforced_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::with_capacity(dir.path().to_path_buf(), 2);
        store
            .upsert_facts(
                &key(),
                vec![
                    MemoryFact::new("low", 0.1),
                    MemoryFact::new("mid", 0.5),
                    MemoryFact::new("high", 0.9),
                ],
            )
            .await
            .unwrap();
        let snap = store.load_facts_snapshot(&key()).await.unwrap();
        let texts: Vec<&str> = snap.facts.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["mid", "high"]);
    }

    #[tokio::test]
    async fn history_appends_and_tails() {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::new(dir.path().to_path_buf());
        for q in ["first", "second", "third"] {
            store.append_history(&key(), entry(q)).await.unwrap();
        }
        let tail = store.load_recent_history(&key(), 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].digest.contains("second"));
        assert!(tail[1].digest.contains("third"));
    }

    #[tokio::test]
    async fn corrupted_history_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::new(dir.path().to_path_buf());
        store.append_history(&key(), entry("good")).await.unwrap();
        let path = dir.path().join("telegram_42").join("history.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("this is not json\n");
        std::fs::write(&path, content).unwrap();

        assert_eq!(store.load_recent_history(&key(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let session_dir = dir.path().join("telegram_42");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_dir.join("facts.json"), "{ nope").unwrap();

        let store = FileMemoryStore::new(dir.path().to_path_buf());
        let err = store.load_facts_snapshot(&key()).await.unwrap_err();
        assert!(matches!(err, MemoryError::CorruptedSnapshot { .. }));
    }

    #[tokio::test]
    async fn missing_session_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::new(dir.path().to_path_buf());
        assert!(store.load_facts_snapshot(&key()).await.unwrap().is_empty());
        assert!(store.load_recent_history(&key(), 5).await.unwrap().is_empty());
    }
}
