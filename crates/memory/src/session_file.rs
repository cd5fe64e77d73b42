//! File-based session store.
//!
//! Each session is one JSON-lines log at `<root>/<session>.jsonl`. Lines are
//! either a `meta` record (mode and metadata, last one wins) or a `turn`
//! record. A turn is written as a single line, so a crash can at worst lose
//! the trailing line, never leave half a turn behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapclaw_core::error::SessionError;
use snapclaw_core::session::{Session, SessionKey, SessionMode, SessionStore};
use snapclaw_core::turn::Turn;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::SessionLocks;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum SessionRecord {
    Meta {
        key: SessionKey,
        mode: SessionMode,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    Turn {
        turn: Box<Turn>,
    },
}

pub struct FileSessionStore {
    root: PathBuf,
    locks: SessionLocks,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: SessionLocks::new(),
        }
    }

    /// Default path: `~/.snapclaw/sessions`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".snapclaw").join("sessions")
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.root.join(format!("{}.jsonl", key.file_stem()))
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<Session>, SessionError> {
        let content = match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Storage(format!("Failed to read session: {e}"))),
        };

        let mut session = Session::new(key.clone());
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<SessionRecord>(line) {
                Ok(SessionRecord::Meta { mode, metadata, created_at, updated_at, .. }) => {
                    session.mode = mode;
                    session.metadata = metadata;
                    session.created_at = created_at;
                    session.updated_at = updated_at;
                }
                Ok(SessionRecord::Turn { turn }) => session.turns.push(*turn),
                Err(e) => warn!(session = %key, error = %e, "Skipping corrupted session line"),
            }
        }
        Ok(Some(session))
    }

    async fn append(&self, key: &SessionKey, record: &SessionRecord) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to create session directory: {e}")))?;

        let mut line = serde_json::to_string(record)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize session record: {e}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(key))
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to open session log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to append session record: {e}")))?;
        file.flush()
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to flush session log: {e}")))
    }

    fn meta_of(session: &Session) -> SessionRecord {
        SessionRecord::Meta {
            key: session.key.clone(),
            mode: session.mode,
            metadata: session.metadata.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    /// Load (or create), apply `change`, append the new meta record.
    async fn update_meta<F>(&self, key: &SessionKey, change: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let _guard = self.locks.lock(key).await;
        let mut session = match self.load(key).await? {
            Some(s) => s,
            None => Session::new(key.clone()),
        };
        change(&mut session);
        session.updated_at = Utc::now();
        self.append(key, &Self::meta_of(&session)).await
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, SessionError> {
        let _guard = self.locks.lock(key).await;
        if let Some(session) = self.load(key).await? {
            return Ok(session);
        }
        let session = Session::new(key.clone());
        self.append(key, &Self::meta_of(&session)).await?;
        debug!(session = %key, "Created session");
        Ok(session)
    }

    async fn append_turn(&self, key: &SessionKey, turn: &Turn) -> Result<(), SessionError> {
        let _guard = self.locks.lock(key).await;
        self.append(key, &SessionRecord::Turn { turn: Box::new(turn.clone()) }).await
    }

    async fn read_metadata(
        &self,
        key: &SessionKey,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SessionError> {
        let _guard = self.locks.lock(key).await;
        Ok(self.load(key).await?.map(|s| s.metadata).unwrap_or_default())
    }

    async fn write_metadata(
        &self,
        key: &SessionKey,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        self.update_meta(key, move |s| s.metadata.extend(patch)).await
    }

    async fn set_mode(&self, key: &SessionKey, mode: SessionMode) -> Result<(), SessionError> {
        self.update_meta(key, move |s| s.mode = mode).await
    }

    async fn list(&self) -> Result<Vec<SessionKey>, SessionError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::Storage(format!("Failed to list sessions: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to list sessions: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            // The key lives in the first meta record; the file name is lossy.
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let key = content
                .lines()
                .find_map(|line| match serde_json::from_str::<SessionRecord>(line) {
                    Ok(SessionRecord::Meta { key, .. }) => Some(key),
                    _ => None,
                });
            if let Some(key) = key {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
