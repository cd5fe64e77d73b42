//! # SnapClaw Core
//!
//! Domain types, capability traits and error definitions for the SnapClaw
//! conversational agent. This crate has **no framework dependencies**: the
//! orchestration engine, memory backends and providers all implement against
//! what is defined here.
//!
//! ## Layout
//!
//! - Sessions own an append-only list of [`Turn`]s and an explicit [`SessionMode`]
//! - A turn is a sequence of [`turn::Step`]s sealed by a [`TurnOutcome`]
//! - Model, tools and persistence are reached only through traits
//!   ([`Provider`], [`ToolCapability`], [`SessionStore`], [`MemoryStore`])

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod session;
pub mod turn;
pub mod memory;
pub mod agent;
pub mod identity;
pub mod event;
pub mod bus;
pub mod redact;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{ModelReply, Provider, ProviderRequest, ProviderResponse, SamplingConfig, ToolDefinition, Usage};
pub use tool::{Tool, ToolCapability, ToolRegistry, ToolResult};
pub use session::{Session, SessionKey, SessionMode, SessionStore};
pub use turn::{Step, StepKind, ToolInvocation, Turn, TurnId, TurnOrigin, TurnOutcome, TurnState};
pub use memory::{FactsSnapshot, HistoryEntry, MemoryFact, MemoryStore, MergeReport};
pub use agent::{AgentConfig, CompressionConfig, CompressionMode, SubagentConfig};
pub use identity::Identity;
pub use event::{DomainEvent, EventBus};
pub use bus::{InboundEvent, InboundMessage, MessageBus, OutboundMessage, SubagentReport};
