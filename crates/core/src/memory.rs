//! Two-layer long-term memory.
//!
//! - **Facts**: a small, mutable, capped set of salient statements per session,
//!   merged idempotently by normalized text.
//! - **History**: an append-only log of per-turn digests, read only by the
//!   rolling-summary stage of compression.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;
use crate::error::MemoryError;
use crate::session::SessionKey;
use crate::turn::{StepKind, Turn, TurnId};

/// Default upper bound on facts kept per session.
pub const DEFAULT_FACTS_CAPACITY: usize = 200;

/// A salient statement worth remembering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub text: String,
    /// In `[0, 1]`.
    pub salience: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_turn: Option<TurnId>,
    pub created_at: DateTime<Utc>,
}

impl MemoryFact {
    pub fn new(text: impl Into<String>, salience: f32) -> Self {
        Self {
            text: text.into(),
            salience: salience.clamp(0.0, 1.0),
            source_turn: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_turn(mut self, turn: TurnId) -> Self {
        self.source_turn = Some(turn);
        self
    }

    /// Merge key: lowercase, collapsed whitespace, no trailing punctuation.
    pub fn normalized(&self) -> String {
        normalize_fact_text(&self.text)
    }
}

pub fn normalize_fact_text(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// What a facts merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub added: usize,
    /// Existing facts whose salience was raised.
    pub updated: usize,
    pub unchanged: usize,
    /// New facts not kept because they ranked below everything at capacity.
    #[serde(default)]
    pub rejected: usize,
    /// Texts of previously stored facts evicted to respect capacity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evicted: Vec<String>,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.evicted.is_empty()
    }
}

/// Order in which facts leave a full snapshot: lowest salience, then oldest,
/// then by normalized text. Total, so the kept set depends only on the facts
/// and never on their position.
fn eviction_order(a: &MemoryFact, b: &MemoryFact) -> Ordering {
    a.salience
        .total_cmp(&b.salience)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.normalized().cmp(&b.normalized()))
}

/// The facts layer of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsSnapshot {
    #[serde(default)]
    pub facts: Vec<MemoryFact>,
    pub updated_at: DateTime<Utc>,
}

impl Default for FactsSnapshot {
    fn default() -> Self {
        Self {
            facts: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl FactsSnapshot {
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Merge a batch into the snapshot.
    ///
    /// Facts match on [`normalize_fact_text`]; a match keeps the existing
    /// text and provenance and takes the larger salience. Over `capacity`,
    /// facts leave in `eviction_order`. A new fact that would itself be
    /// evicted is rejected instead of added, so applying the same batch twice
    /// leaves the snapshot unchanged even at capacity.
    pub fn merge(&mut self, batch: &[MemoryFact], capacity: usize) -> MergeReport {
        let mut report = MergeReport::default();
        let first_new = self.facts.len();

        for incoming in batch {
            let key = incoming.normalized();
            if key.is_empty() {
                continue;
            }
            match self.facts.iter().position(|f| f.normalized() == key) {
                // Repeated within this batch: fold into the pending addition.
                Some(i) if i >= first_new => {
                    let pending = &mut self.facts[i];
                    pending.salience = pending.salience.max(incoming.salience.clamp(0.0, 1.0));
                }
                Some(i) => {
                    let existing = &mut self.facts[i];
                    if incoming.salience > existing.salience {
                        existing.salience = incoming.salience.clamp(0.0, 1.0);
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                None => {
                    let mut fact = incoming.clone();
                    fact.salience = fact.salience.clamp(0.0, 1.0);
                    self.facts.push(fact);
                    report.added += 1;
                }
            }
        }

        let (evicted, rejected) = self.evict_to(capacity, first_new);
        report.added -= rejected;
        report.rejected = rejected;
        report.evicted = evicted;
        if !report.is_noop() {
            self.updated_at = Utc::now();
        }
        report
    }

    /// Drop facts in `eviction_order` until `capacity` remain. Facts at or
    /// after `first_new` were added by the current merge. Returns the texts
    /// of evicted stored facts and the number of rejected new ones.
    fn evict_to(&mut self, capacity: usize, first_new: usize) -> (Vec<String>, usize) {
        let excess = self.facts.len().saturating_sub(capacity);
        if excess == 0 {
            return (Vec::new(), 0);
        }

        let mut order: Vec<usize> = (0..self.facts.len()).collect();
        order.sort_by(|&a, &b| eviction_order(&self.facts[a], &self.facts[b]));
        let victims: HashSet<usize> = order[..excess].iter().copied().collect();

        let mut evicted = Vec::new();
        let mut rejected = 0;
        for &i in &order[..excess] {
            if i < first_new {
                evicted.push(self.facts[i].text.clone());
            } else {
                rejected += 1;
            }
        }

        let mut index = 0;
        self.facts.retain(|_| {
            let keep = !victims.contains(&index);
            index += 1;
            keep
        });
        (evicted, rejected)
    }

    /// Facts ordered by salience, highest first.
    pub fn ranked(&self) -> Vec<&MemoryFact> {
        let mut facts: Vec<&MemoryFact> = self.facts.iter().collect();
        facts.sort_by(|a, b| eviction_order(b, a));
        facts
    }
}

/// Immutable digest of one past turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub session_key: SessionKey,
    pub source_turn: TurnId,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

const DIGEST_SNIPPET_CHARS: usize = 220;

impl HistoryEntry {
    /// Build a one-line digest of a sealed turn: user request, tools used and
    /// the outcome.
    pub fn from_turn(turn: &Turn) -> Self {
        let mut tools: Vec<String> = Vec::new();
        for step in &turn.steps {
            if let StepKind::ToolCalls { invocations, .. } = &step.kind {
                for inv in invocations {
                    if !tools.contains(&inv.name) {
                        tools.push(inv.name.clone());
                    }
                }
            }
        }

        let mut digest = format!("User: {}", snippet(&turn.user_message, DIGEST_SNIPPET_CHARS));
        if !tools.is_empty() {
            digest.push_str(&format!(" | Tools: {}", tools.join(", ")));
        }
        match &turn.outcome {
            Some(outcome) => match outcome.reply() {
                Some(reply) => digest.push_str(&format!(
                    " | Assistant ({}): {}",
                    outcome.label(),
                    snippet(reply, DIGEST_SNIPPET_CHARS)
                )),
                None => digest.push_str(&format!(" | Outcome: {}", outcome.label())),
            },
            None => digest.push_str(" | Outcome: open"),
        }

        Self {
            id: Uuid::new_v4().to_string(),
            session_key: turn.session_key.clone(),
            source_turn: turn.id.clone(),
            digest,
            topic_tags: tools,
            timestamp: turn.ended_at.unwrap_or(turn.started_at),
        }
    }
}

/// Collapse whitespace and cap at `max` chars with a trailing ellipsis.
pub fn snippet(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let keep = max.saturating_sub(3);
    let mut out: String = flat.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Persistent two-layer memory.
///
/// Facts mutations for one session are serialized by the implementation;
/// history appends never take the facts lock.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The backend name (e.g., "file", "in_memory", "none").
    fn name(&self) -> &str;

    async fn upsert_facts(
        &self,
        session: &SessionKey,
        facts: Vec<MemoryFact>,
    ) -> std::result::Result<MergeReport, MemoryError>;

    async fn append_history(
        &self,
        session: &SessionKey,
        entry: HistoryEntry,
    ) -> std::result::Result<(), MemoryError>;

    async fn load_facts_snapshot(&self, session: &SessionKey) -> std::result::Result<FactsSnapshot, MemoryError>;

    /// The most recent `limit` entries, oldest first.
    async fn load_recent_history(
        &self,
        session: &SessionKey,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryEntry>, MemoryError>;
}
