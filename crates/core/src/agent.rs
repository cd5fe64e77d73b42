//! Runtime knobs for the orchestration engine.
//!
//! These are plain serde structs so the config crate can embed them as TOML
//! sections directly.

use serde::{Deserialize, Serialize};

/// Per-turn limits and loop-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model calls per turn (safety limit)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Trailing window of tool names the loop guard inspects
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,

    /// Tools treated as "search" for the per-turn cap and fuzzy cache keys
    #[serde(default = "default_search_tools")]
    pub search_tools: Vec<String>,

    /// Search invocations allowed per turn before calls are blocked
    #[serde(default = "default_max_searches")]
    pub max_searches_per_turn: usize,

    /// Tool output is truncated to this many chars when persisted
    #[serde(default = "default_tool_result_max_chars")]
    pub tool_result_max_chars: usize,

    /// Model context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Strip `<think>`-style reasoning blocks from model text
    #[serde(default = "default_true")]
    pub strip_reasoning: bool,

    /// Wrap tool output and runtime metadata in trust-boundary markers
    #[serde(default = "default_true")]
    pub content_tagging: bool,

    /// Messages that arrive while a session is busy are injected into the
    /// running turn instead of queueing behind it
    #[serde(default)]
    pub enable_event_handling: bool,
}

fn default_max_iterations() -> u32 {
    40
}
fn default_loop_window() -> usize {
    3
}
fn default_search_tools() -> Vec<String> {
    vec!["web_search".into()]
}
fn default_max_searches() -> usize {
    4
}
fn default_tool_result_max_chars() -> usize {
    500
}
fn default_context_window() -> usize {
    65_536
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            loop_window: default_loop_window(),
            search_tools: default_search_tools(),
            max_searches_per_turn: default_max_searches(),
            tool_result_max_chars: default_tool_result_max_chars(),
            context_window: default_context_window(),
            strip_reasoning: true,
            content_tagging: true,
            enable_event_handling: false,
        }
    }
}

impl AgentConfig {
    pub fn is_search_tool(&self, name: &str) -> bool {
        self.search_tools.iter().any(|t| t == name)
    }
}

/// How hard the compressor works.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Pass history through; only the hard budget cut applies
    Off,
    #[default]
    Balanced,
    /// Fewer verbatim turns, fewer facts, smaller budget
    Aggressive,
}

impl std::str::FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("unknown compression mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub mode: CompressionMode,

    /// Fraction of the model context window the assembled input may use
    #[serde(default = "default_ratio")]
    pub token_budget_ratio: f32,

    #[serde(default = "default_recency_turns")]
    pub recency_turns: usize,

    /// Minimum salience for heuristic fact extraction
    #[serde(default = "default_salience_threshold")]
    pub salience_threshold: f32,

    #[serde(default = "default_max_facts")]
    pub max_facts: usize,

    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,

    /// Tokens the output may exceed the budget by. Zero means a hard cap.
    #[serde(default)]
    pub overrun_tolerance_tokens: usize,

    /// Use the model for fact extraction and summaries instead of heuristics
    #[serde(default)]
    pub model_backed: bool,
}

fn default_ratio() -> f32 {
    0.65
}
fn default_recency_turns() -> usize {
    6
}
fn default_salience_threshold() -> f32 {
    0.7
}
fn default_max_facts() -> usize {
    12
}
fn default_max_summary_chars() -> usize {
    1400
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            mode: CompressionMode::Balanced,
            token_budget_ratio: default_ratio(),
            recency_turns: default_recency_turns(),
            salience_threshold: default_salience_threshold(),
            max_facts: default_max_facts(),
            max_summary_chars: default_max_summary_chars(),
            overrun_tolerance_tokens: 0,
            model_backed: false,
        }
    }
}

impl CompressionConfig {
    /// The settings actually applied for the configured mode.
    pub fn effective(&self) -> Self {
        let mut out = self.clone();
        out.recency_turns = out.recency_turns.max(1);
        out.max_facts = out.max_facts.max(1);
        out.max_summary_chars = out.max_summary_chars.max(200);
        if out.mode == CompressionMode::Aggressive {
            out.recency_turns = (out.recency_turns / 2).max(2).min(out.recency_turns);
            out.max_facts = (out.max_facts * 2 / 3).max(1);
            out.max_summary_chars = (out.max_summary_chars / 2).max(200);
            out.token_budget_ratio *= 0.75;
        }
        out
    }

    /// Token budget for a model with the given context window.
    pub fn budget_for(&self, context_window: usize) -> usize {
        let ratio = self.effective().token_budget_ratio.clamp(0.0, 1.0);
        (context_window as f64 * ratio as f64).round() as usize
    }
}

/// Limits for background sub-tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(default = "default_subagent_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_subagent_iterations() -> u32 {
    15
}
fn default_max_concurrent() -> usize {
    4
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_subagent_iterations(),
            max_concurrent: default_max_concurrent(),
        }
    }
}
