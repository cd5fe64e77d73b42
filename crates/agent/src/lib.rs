//! The orchestration engine — the heart of SnapClaw.
//!
//! A turn runs as an explicit state machine:
//!
//! 1. **Build context** (system prompt + facts + rolling summary + recent turns)
//! 2. **Call the model** via the configured provider
//! 3. **If tool calls**: resolve them through the turn's cache and loop guard,
//!    append results, go back to step 2
//! 4. **If text**: seal the turn and reply
//!
//! The loop ends on a final answer, on cancellation or when the iteration
//! budget runs out. Every ending persists the turn.

pub mod context;
pub mod guard;
pub mod orchestrator;
pub mod prompt_guard;
pub mod runtime;
pub mod stream_event;
pub mod subagent;
pub mod think;

#[cfg(test)]
mod test_helpers;

pub use context::{
    AssemblyError, AssemblyMetadata, BuildRequest, CompressedContext, CompressionReport, CompressionState,
    ContextBuilder, ContextCompressor, ContextInput, DropInfo, LayerStats, RuntimeContext,
};
pub use guard::{CacheStatus, LoopGuard, Nudge, ToolCallCache};
pub use orchestrator::{ConversationOrchestrator, TurnInput};
pub use runtime::{AgentRuntime, Command};
pub use stream_event::{ProgressSink, TurnEvent};
pub use subagent::{SnapshotMemory, SpawnTool, SubagentHandle, SubagentManager};
