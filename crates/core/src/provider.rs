//! Provider trait — the abstraction over LLM backends.
//!
//! The orchestrator only ever calls [`Provider::complete`] and inspects the
//! result through [`ProviderResponse::reply`], which classifies it as either a
//! final text answer or a batch of tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Sampling knobs carried from configuration into every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4".into(),
            temperature: default_temperature(),
            max_tokens: Some(4096),
        }
    }
}

impl ProviderRequest {
    /// Build a request from sampling config, messages and tool definitions.
    pub fn new(sampling: &SamplingConfig, messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            model: sampling.model.clone(),
            messages,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            tools,
            stop: Vec::new(),
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Provider-specific metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// What the model asked for on this step.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// A final answer. Ends the turn.
    Text(String),
    /// One or more tool calls, with optional accompanying text.
    ToolCalls {
        thought: Option<String>,
        calls: Vec<MessageToolCall>,
    },
}

impl ProviderResponse {
    /// Classify the response. Tool calls take precedence over content.
    pub fn reply(&self) -> ModelReply {
        if self.message.tool_calls.is_empty() {
            return ModelReply::Text(self.message.content.clone());
        }
        let thought = if self.message.content.trim().is_empty() {
            None
        } else {
            Some(self.message.content.clone())
        };
        ModelReply::ToolCalls {
            thought,
            calls: self.message.tool_calls.clone(),
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate another step's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// The core Provider trait.
///
/// Every LLM backend implements this trait. The orchestrator never retries:
/// backoff on rate limits is the adapter's job, and any error that escapes
/// `complete()` ends the turn.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}
