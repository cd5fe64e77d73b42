//! Configuration loading, validation, and management for SnapClaw.
//!
//! Loads configuration from `~/.snapclaw/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use snapclaw_core::agent::{AgentConfig, CompressionConfig, SubagentConfig};
use snapclaw_core::identity::Identity;
use snapclaw_core::provider::SamplingConfig;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.snapclaw/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the OpenAI-compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Turn loop knobs
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub subagents: SubagentConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("compression", &self.compression)
            .field("memory", &self.memory)
            .field("subagents", &self.subagents)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Where sessions and memory live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackend {
    /// JSONL session logs plus `facts.json` / `history.jsonl` per session
    #[default]
    File,
    /// Process memory only
    InMemory,
    /// Sessions in process memory, long-term memory disabled
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackend,

    /// Storage directory; defaults to `~/.snapclaw/data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Upper bound on facts kept per session
    #[serde(default = "default_facts_capacity")]
    pub facts_capacity: usize,
}

fn default_facts_capacity() -> usize {
    snapclaw_core::memory::DEFAULT_FACTS_CAPACITY
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::default(),
            directory: None,
            facts_capacity: default_facts_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,

    /// Override the system prompt entirely (skips file loading)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,

    /// Directory holding AGENTS.md, SOUL.md and friends; defaults to
    /// `~/.snapclaw/workspace`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

fn default_identity_name() -> String {
    "SnapClaw".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            system_prompt_override: None,
            workspace: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Priority: environment variables > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` reads one variable.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("SNAPCLAW_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(model) = lookup("SNAPCLAW_MODEL") {
            self.default_model = model;
        }
        if let Some(url) = lookup("SNAPCLAW_API_URL") {
            self.api_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".snapclaw")
    }

    /// Directory for session logs and memory files.
    pub fn data_dir(&self) -> PathBuf {
        self.memory
            .directory
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Directory for identity bootstrap files.
    pub fn workspace_dir(&self) -> PathBuf {
        self.identity
            .workspace
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("workspace"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let ratio = self.compression.token_budget_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "compression.token_budget_ratio must be in (0, 1]".into(),
            ));
        }

        if self.agent.context_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.context_window must be at least 1".into(),
            ));
        }

        if self.agent.max_iterations == 0 || self.subagents.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be at least 1".into(),
            ));
        }

        if self.subagents.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "subagents.max_concurrent must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Sampling parameters for model calls.
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            model: self.default_model.clone(),
            temperature: self.default_temperature,
            max_tokens: Some(self.default_max_tokens),
        }
    }

    /// The agent identity: the override prompt when set, bootstrap files
    /// from the workspace otherwise.
    pub fn identity(&self) -> Identity {
        match &self.identity.system_prompt_override {
            Some(prompt) => Identity::with_prompt(self.identity.name.clone(), prompt.clone()),
            None => Identity::load(&self.identity.name, Some(&self.workspace_dir())),
        }
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            compression: CompressionConfig::default(),
            memory: MemoryConfig::default(),
            subagents: SubagentConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
