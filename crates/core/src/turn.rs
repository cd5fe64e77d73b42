//! Turns and steps.
//!
//! A turn is one user message and everything the agent did to answer it. It is
//! built up step by step by the orchestrator and sealed with a [`TurnOutcome`];
//! after that it never changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::message::{Message, MessageToolCall};
use crate::provider::Usage;
use crate::session::{SessionKey, SessionMode};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who started a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOrigin {
    #[default]
    User,
    /// A system-originated turn, e.g. a finished subagent reporting back.
    System { source: String },
}

/// One executed (or answered-from-cache, or blocked) tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub fingerprint: String,
    pub output: String,
    pub success: bool,
    /// Answered from the turn's cache rather than invoking the tool.
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A final text answer.
    Text { text: String },
    /// Tool calls and their observations. Never terminal.
    ToolCalls {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
        invocations: Vec<ToolInvocation>,
    },
}

/// One model round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position within the turn.
    pub index: u32,
    pub kind: StepKind,
    /// Loop-guard nudge injected before the model call that produced this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nudge: Option<String>,
    /// User events delivered mid-turn, before the model call that produced
    /// this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn tool_names(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::Text { .. } => Vec::new(),
            StepKind::ToolCalls { invocations, .. } => {
                invocations.iter().map(|i| i.name.as_str()).collect()
            }
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { reply: String },
    /// The iteration budget ran out before a final answer.
    BudgetExhausted { reply: String },
    Cancelled,
    Failed {
        error: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_reply: Option<String>,
    },
}

impl TurnOutcome {
    /// Text to deliver back to the user, if any.
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Completed { reply } | Self::BudgetExhausted { reply } => Some(reply),
            Self::Cancelled => None,
            Self::Failed { partial_reply, .. } => partial_reply.as_deref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Orchestrator state. `Done`, `Cancelled`, `BudgetExhausted` and `Error` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Building,
    AwaitingModel,
    TextDone,
    ExecutingTools,
    Done,
    Cancelled,
    BudgetExhausted,
    Error,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::BudgetExhausted | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_key: SessionKey,
    /// Set for subagent turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_turn: Option<TurnId>,
    #[serde(default)]
    pub origin: TurnOrigin,
    pub mode: SessionMode,
    pub user_message: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TurnOutcome>,
    /// Model calls made.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(session_key: SessionKey, mode: SessionMode, user_message: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            session_key,
            parent_turn: None,
            origin: TurnOrigin::User,
            mode,
            user_message: user_message.into(),
            steps: Vec::new(),
            outcome: None,
            iterations: 0,
            usage: Usage::default(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn with_parent(mut self, parent: TurnId) -> Self {
        self.parent_turn = Some(parent);
        self
    }

    pub fn with_origin(mut self, origin: TurnOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Record a step. Ignored once the turn is sealed.
    pub fn push_step(&mut self, step: Step) {
        if self.is_sealed() {
            return;
        }
        self.steps.push(step);
    }

    /// Seal the turn. The first outcome wins.
    pub fn seal(&mut self, outcome: TurnOutcome) {
        if self.is_sealed() {
            return;
        }
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
    }

    pub fn reply(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.reply())
    }

    /// Every tool invocation in step order.
    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.steps.iter().flat_map(|s| match &s.kind {
            StepKind::ToolCalls { invocations, .. } => invocations.as_slice(),
            StepKind::Text { .. } => &[],
        })
    }

    /// Replay the turn as model messages for later history.
    ///
    /// Only invocations that actually produced an observation are replayed, so
    /// every assistant tool call has a matching tool message.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = vec![Message::user(self.user_message.clone())];
        for step in &self.steps {
            if let Some(events) = crate::bus::format_events(&step.interrupts) {
                out.push(Message::user(events));
            }
            match &step.kind {
                StepKind::Text { text } => out.push(Message::assistant(text.clone())),
                StepKind::ToolCalls { thought, invocations } => {
                    if invocations.is_empty() {
                        continue;
                    }
                    let calls = invocations
                        .iter()
                        .map(|inv| MessageToolCall {
                            id: inv.call_id.clone(),
                            name: inv.name.clone(),
                            arguments: inv.arguments.to_string(),
                        })
                        .collect();
                    out.push(Message::assistant_tool_calls(
                        thought.clone().unwrap_or_default(),
                        calls,
                    ));
                    for inv in invocations {
                        out.push(Message::tool_result(inv.call_id.clone(), inv.output.clone()));
                    }
                }
            }
        }
        if let Some(TurnOutcome::BudgetExhausted { reply }) = &self.outcome {
            out.push(Message::assistant(reply.clone()));
        }
        out
    }
}
