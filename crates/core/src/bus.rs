//! Message bus between transports and the agent runtime.
//!
//! Transports push [`InboundEvent`]s and drain [`OutboundMessage`]s. Finished
//! subagents re-enter through the same inbound queue as
//! [`InboundEvent::SubagentResult`], so the runtime handles them like any
//! other event instead of a side channel.
//!
//! Messages for a session that is already running a turn can instead go to
//! that session's event channel ([`MessageBus::publish_event`]). The running
//! turn drains it between steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use crate::error::{Error, Result};
use crate::session::SessionKey;
use crate::turn::TurnId;

/// A message received from a chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: "user".to_string(),
            chat_id: chat_id.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.channel, &self.chat_id)
    }
}

/// The result of a finished background sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentReport {
    pub task_id: String,
    pub label: String,
    pub task: String,
    pub parent_session: SessionKey,
    pub parent_turn: TurnId,
    /// Outcome label of the sub-task's turn.
    pub outcome: String,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    UserMessage(InboundMessage),
    SubagentResult(SubagentReport),
}

impl InboundEvent {
    pub fn session_key(&self) -> SessionKey {
        match self {
            Self::UserMessage(msg) => msg.session_key(),
            Self::SubagentResult(report) => report.parent_session.clone(),
        }
    }
}

/// A message to deliver to a chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Intermediate progress (tool hints) rather than a final reply.
    #[serde(default)]
    pub progress: bool,
}

impl OutboundMessage {
    pub fn reply(channel: &str, chat_id: &str, content: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.into(),
            progress: false,
        }
    }

    pub fn progress(channel: &str, chat_id: &str, content: impl Into<String>) -> Self {
        Self {
            progress: true,
            ..Self::reply(channel, chat_id, content)
        }
    }
}

/// Sending half of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageBus {
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    events: Arc<Mutex<HashMap<SessionKey, Vec<String>>>>,
}

/// Receiving halves, owned by the runtime and the transport respectively.
#[derive(Debug)]
pub struct BusReceivers {
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, BusReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: inbound_tx,
                outbound: outbound_tx,
                events: Arc::new(Mutex::new(HashMap::new())),
            },
            BusReceivers {
                inbound: inbound_rx,
                outbound: outbound_rx,
            },
        )
    }

    pub async fn publish_inbound(&self, event: InboundEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| Error::Internal("inbound queue closed".into()))
    }

    pub async fn publish_outbound(&self, message: OutboundMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::Internal("outbound queue closed".into()))
    }

    /// Queue a mid-turn event for `session`. Never blocks.
    pub fn publish_event(&self, session: &SessionKey, content: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session.clone())
            .or_default()
            .push(content.into());
    }

    /// Take every queued event for `session`, oldest first.
    pub fn drain_events(&self, session: &SessionKey) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session)
            .unwrap_or_default()
    }

    /// Number of events waiting for `session`.
    pub fn queued_events(&self, session: &SessionKey) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .map_or(0, Vec::len)
    }

    /// Put events that were taken but never delivered back at the front of
    /// the queue, ahead of anything published since.
    pub fn requeue_events(&self, session: &SessionKey, events: Vec<String>) {
        if events.is_empty() {
            return;
        }
        let mut channels = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = channels.entry(session.clone()).or_default();
        queue.splice(0..0, events);
    }

    /// Drained events as a bullet list, or `None` when nothing is queued.
    pub fn check_events(&self, session: &SessionKey) -> Option<String> {
        format_events(&self.drain_events(session))
    }
}

/// `- first\n- second`, or `None` for an empty batch.
pub fn format_events(events: &[String]) -> Option<String> {
    if events.is_empty() {
        return None;
    }
    Some(events.iter().map(|e| format!("- {e}")).collect::<Vec<_>>().join("\n"))
}
