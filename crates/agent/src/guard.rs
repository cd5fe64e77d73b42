//! Per-turn tool-call deduplication and loop detection.
//!
//! Both structures live for exactly one turn and are dropped with it, so a
//! cached result can never go stale across turns.

use sha2::{Digest, Sha256};
use snapclaw_core::error::ToolError;
use snapclaw_core::tool::ToolResult;
use std::collections::{HashMap, VecDeque};
use std::future::Future;

/// Stable fingerprint of a tool call: SHA-256 over the tool name and the
/// arguments with object keys sorted at every depth.
pub fn fingerprint(name: &str, arguments: &serde_json::Value) -> String {
    let mut canonical = String::new();
    write_canonical(arguments, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "do", "does", "did",
    "have", "has", "had", "having", "will", "would", "shall", "should", "may", "might", "can",
    "could", "of", "in", "on", "at", "to", "for", "with", "by", "from", "as", "into", "through",
    "about", "between", "what", "how", "who", "where", "when", "which", "why", "that", "this",
    "these", "those", "i", "me", "my", "we", "our", "you", "your", "he", "she", "it", "they",
    "them", "their", "and", "or", "but", "not", "no", "nor", "so", "yet", "tell", "please",
    "show", "find", "get", "let",
];

/// Reduce a search query to an order-insensitive token set, so that
/// "What is Python?" and "python, what is" share a key.
pub fn normalize_query(query: &str) -> String {
    let lowered: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = lowered
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

fn query_of(arguments: &serde_json::Value) -> Option<&str> {
    arguments.get("query").and_then(|q| q.as_str())
}

/// Whether a call was answered from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// The cache key of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallKey {
    /// Entry the call resolves to. For a rephrased search this is the
    /// fingerprint of the first equivalent query.
    pub fingerprint: String,
    /// Fingerprint of this call's own arguments.
    pub exact: String,
    /// Normalized query index key, for search tools.
    query_key: Option<String>,
}

pub type ToolOutcome = Result<ToolResult, ToolError>;

/// Turn-scoped cache of tool outcomes keyed by fingerprint.
///
/// Search tools are additionally indexed by normalized query, so a rephrased
/// search resolves to the fingerprint of the first equivalent one.
#[derive(Debug, Default)]
pub struct ToolCallCache {
    entries: HashMap<String, ToolOutcome>,
    query_index: HashMap<String, String>,
    search_tools: Vec<String>,
    hits: usize,
    misses: usize,
}

impl ToolCallCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_tools(search_tools: Vec<String>) -> Self {
        Self {
            search_tools,
            ..Self::default()
        }
    }

    fn is_search_tool(&self, name: &str) -> bool {
        self.search_tools.iter().any(|t| t == name)
    }

    /// Compute the cache key for a call.
    pub fn key_for(&self, name: &str, arguments: &serde_json::Value) -> CallKey {
        let exact = fingerprint(name, arguments);
        if !self.is_search_tool(name) {
            return CallKey { fingerprint: exact.clone(), exact, query_key: None };
        }
        let normalized = query_of(arguments).map(normalize_query).unwrap_or_default();
        if normalized.is_empty() {
            return CallKey { fingerprint: exact.clone(), exact, query_key: None };
        }
        let query_key = format!("{name}\u{0}{normalized}");
        let fingerprint = match self.query_index.get(&query_key) {
            Some(existing) if !self.entries.contains_key(&exact) => existing.clone(),
            _ => exact.clone(),
        };
        CallKey { fingerprint, exact, query_key: Some(query_key) }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&ToolOutcome> {
        self.entries.get(fingerprint)
    }

    pub fn insert(&mut self, key: &CallKey, outcome: ToolOutcome) {
        if let Some(query_key) = &key.query_key {
            self.query_index
                .entry(query_key.clone())
                .or_insert_with(|| key.fingerprint.clone());
        }
        self.entries.insert(key.fingerprint.clone(), outcome);
    }

    /// Return the cached outcome for `key`, or run `compute` once and cache it.
    pub async fn get_or_compute<F, Fut>(&mut self, key: &CallKey, compute: F) -> (ToolOutcome, CacheStatus)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ToolOutcome>,
    {
        if let Some(cached) = self.entries.get(&key.fingerprint) {
            self.hits += 1;
            return (cached.clone(), CacheStatus::Hit);
        }
        self.misses += 1;
        let outcome = compute().await;
        self.insert(key, outcome.clone());
        (outcome, CacheStatus::Miss)
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A corrective instruction injected before the next model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nudge {
    pub tool_name: String,
    pub message: String,
}

/// Detects repeated tool patterns within a turn and caps search volume.
#[derive(Debug)]
pub struct LoopGuard {
    window: usize,
    recent: VecDeque<String>,
    search_tools: Vec<String>,
    max_searches: usize,
    searches: Vec<String>,
}

impl LoopGuard {
    pub fn new(window: usize, search_tools: Vec<String>, max_searches: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::new(),
            search_tools,
            max_searches,
            searches: Vec::new(),
        }
    }

    pub fn is_search_tool(&self, name: &str) -> bool {
        self.search_tools.iter().any(|t| t == name)
    }

    /// Record one tool call. Returns a nudge iff the trailing window is full
    /// and every name in it is the same.
    pub fn observe(&mut self, tool_name: &str) -> Option<Nudge> {
        self.recent.push_back(tool_name.to_string());
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
        if self.recent.len() < self.window || self.recent.iter().any(|n| n != tool_name) {
            return None;
        }

        let mut message = format!(
            "You have called `{tool_name}` {} times in a row. Stop repeating it. \
             Use the results you already have to answer, or try a different approach.",
            self.window
        );
        if self.is_search_tool(tool_name) && !self.searches.is_empty() {
            message.push('\n');
            message.push_str(&self.search_history_summary());
        }
        Some(Nudge {
            tool_name: tool_name.to_string(),
            message,
        })
    }

    /// Whether another search may run this turn.
    pub fn search_allowed(&self, tool_name: &str) -> bool {
        !self.is_search_tool(tool_name) || self.searches.len() < self.max_searches
    }

    /// Count an executed search.
    pub fn record_search(&mut self, tool_name: &str, arguments: &serde_json::Value) {
        if self.is_search_tool(tool_name) {
            self.searches.push(query_of(arguments).unwrap_or_default().to_string());
        }
    }

    pub fn search_count(&self) -> usize {
        self.searches.len()
    }

    /// Observation returned instead of running a search over the cap.
    pub fn blocked_observation(&self) -> String {
        format!(
            "Search limit reached ({} searches this turn). The search was not executed. \
             Answer with the information already gathered.\n{}",
            self.max_searches,
            self.search_history_summary()
        )
    }

    pub fn search_history_summary(&self) -> String {
        if self.searches.is_empty() {
            return "No searches performed yet.".into();
        }
        let lines: Vec<String> = self
            .searches
            .iter()
            .enumerate()
            .map(|(i, q)| format!("  {}. \"{q}\"", i + 1))
            .collect();
        format!("Searches already performed:\n{}", lines.join("\n"))
    }
}
