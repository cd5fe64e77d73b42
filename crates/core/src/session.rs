//! Session aggregate and its persistence seam.
//!
//! A session is the long-lived conversation with one peer. It owns an
//! append-only list of turns, a free-form metadata map and an explicit mode.
//! The orchestrator appends turns; only the runtime's command handlers change
//! the mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::SessionError;
use crate::turn::Turn;

/// Stable identifier of a session, conventionally `channel:chat_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self(format!("{channel}:{chat_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A filesystem-safe rendering of the key.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the agent should behave for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Normal,
    /// Produce a numbered plan before acting.
    Plan,
    /// Diagnose a failure instead of continuing the task.
    Doctor,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Plan => "plan",
            Self::Doctor => "doctor",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionMode {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "plan" => Ok(Self::Plan),
            "doctor" => Ok(Self::Doctor),
            other => Err(SessionError::InvalidMode(other.to_string())),
        }
    }
}

/// A conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,

    /// Ordered, append-only.
    #[serde(default)]
    pub turns: Vec<Turn>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub mode: SessionMode,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            turns: Vec::new(),
            metadata: serde_json::Map::new(),
            mode: SessionMode::Normal,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a sealed turn.
    pub fn push_turn(&mut self, turn: Turn) {
        self.updated_at = Utc::now();
        self.turns.push(turn);
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

/// Persistence seam for sessions.
///
/// Implementations must make `append_turn` atomic per turn: a reader never
/// observes a half-written turn.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn name(&self) -> &str;

    /// Load a session, creating an empty one if it does not exist yet.
    async fn get_or_create(&self, key: &SessionKey) -> std::result::Result<Session, SessionError>;

    /// Append a sealed turn to the session log.
    async fn append_turn(&self, key: &SessionKey, turn: &Turn) -> std::result::Result<(), SessionError>;

    async fn read_metadata(
        &self,
        key: &SessionKey,
    ) -> std::result::Result<serde_json::Map<String, serde_json::Value>, SessionError>;

    /// Shallow-merge `patch` into the session metadata.
    async fn write_metadata(
        &self,
        key: &SessionKey,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<(), SessionError>;

    async fn set_mode(&self, key: &SessionKey, mode: SessionMode) -> std::result::Result<(), SessionError>;

    /// Keys of all known sessions.
    async fn list(&self) -> std::result::Result<Vec<SessionKey>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_channel_and_chat() {
        let key = SessionKey::new("telegram", "42");
        assert_eq!(key.as_str(), "telegram:42");
        assert_eq!(key.file_stem(), "telegram_42");
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("PLAN".parse::<SessionMode>().unwrap(), SessionMode::Plan);
        assert_eq!(" doctor ".parse::<SessionMode>().unwrap(), SessionMode::Doctor);
        assert!("chaos".parse::<SessionMode>().is_err());
        assert_eq!(SessionMode::Normal.to_string(), "normal");
    }

    #[test]
    fn new_session_is_normal_and_empty() {
        let session = Session::new(SessionKey::from("cli:direct"));
        assert_eq!(session.mode, SessionMode::Normal);
        assert!(session.turns.is_empty());
        assert!(session.last_turn().is_none());
    }
}
