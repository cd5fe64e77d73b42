//! Domain event system — decoupled observation of the engine.
//!
//! The orchestrator, compressor and subagent manager publish here; the CLI
//! (or any observer) subscribes. Publishing never blocks and never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    TurnStarted {
        session: String,
        turn_id: String,
        timestamp: DateTime<Utc>,
    },

    TurnFinished {
        session: String,
        turn_id: String,
        outcome: String,
        iterations: u32,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool call was resolved (executed, cached or blocked)
    ToolExecuted {
        session: String,
        tool_name: String,
        success: bool,
        cached: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The loop guard detected a repeated tool pattern
    LoopNudge {
        session: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },

    ContextCompressed {
        session: String,
        kept_turns: usize,
        folded_turns: usize,
        dropped_turns: usize,
        facts_added: usize,
        tokens: usize,
        budget: usize,
        timestamp: DateTime<Utc>,
    },

    SubagentSpawned {
        session: String,
        task_id: String,
        label: String,
        timestamp: DateTime<Utc>,
    },

    SubagentFinished {
        session: String,
        task_id: String,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::LoopNudge {
            session: "cli:direct".into(),
            tool_name: "web_search".into(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::LoopNudge { tool_name, .. } => assert_eq!(tool_name, "web_search"),
            _ => panic!("Expected LoopNudge event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
