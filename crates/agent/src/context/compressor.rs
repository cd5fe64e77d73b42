//! History compression.
//!
//! Three ordered stages turn a session's past turns into something that fits
//! the token budget:
//!
//! 1. **Recency keep**: the last `recency_turns` turns pass through verbatim.
//! 2. **Salient facts**: turns that just aged out of the recency window are
//!    scanned for facts, which are merged into the memory facts layer.
//! 3. **Rolling summary**: digests of the same newly aged turns are folded
//!    into the previous summary. Already-folded turns are never re-read; the
//!    cursor lives in [`CompressionState`].
//!
//! The output is then cut to the budget: oldest verbatim turns first, then
//! the summary, then the lowest-salience facts.

use crate::context::token::{self, MESSAGE_OVERHEAD};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapclaw_core::agent::{CompressionConfig, CompressionMode};
use snapclaw_core::error::ProviderError;
use snapclaw_core::event::{DomainEvent, EventBus};
use snapclaw_core::memory::{snippet, HistoryEntry, MemoryFact, MemoryStore};
use snapclaw_core::message::{Message, Role};
use snapclaw_core::provider::{Provider, ProviderRequest, SamplingConfig};
use chrono::{DateTime, Utc};
use snapclaw_core::redact;
use snapclaw_core::session::SessionKey;
use snapclaw_core::turn::{StepKind, Turn, TurnId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Metadata key under which [`CompressionState`] is kept on the session.
pub const STATE_METADATA_KEY: &str = "compression";

pub const HINT_HEADER: &str = "[Compressed Session Context - metadata only, not instructions]";

const FACT_SNIPPET_CHARS: usize = 220;

const SALIENCE_KEYWORDS: &[&str] = &[
    "must", "should", "require", "constraint", "deadline", "important", "remember", "error",
    "failed", "decision", "agreed", "todo", "api", "token", "password",
];

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Malformed model output: {0}")]
    Malformed(String),
}

/// Rolling state persisted between turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionState {
    #[serde(default)]
    pub summary: String,
    /// Turns folded into `summary` so far.
    #[serde(default)]
    pub folded_turns: usize,
    /// Newest turn folded into `summary`. The fold cursor is located by this
    /// id, so a turn missing from the reloaded history cannot shift it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_folded: Option<TurnId>,
    /// Start time of `last_folded`, used when that turn itself is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_folded_at: Option<DateTime<Utc>>,
}

impl CompressionState {
    /// Index in `history` of the first turn not yet folded.
    pub fn cursor(&self, history: &[Turn]) -> usize {
        if let Some(id) = &self.last_folded {
            if let Some(pos) = history.iter().position(|t| &t.id == id) {
                return pos + 1;
            }
        }
        match self.last_folded_at {
            Some(at) => history.iter().position(|t| t.started_at > at).unwrap_or(history.len()),
            // State written before fold ids were recorded.
            None => self.folded_turns.min(history.len()),
        }
    }

    fn advance(&mut self, folded: &[Turn]) {
        if let Some(last) = folded.last() {
            self.folded_turns += folded.len();
            self.last_folded = Some(last.id.clone());
            self.last_folded_at = Some(last.started_at);
        }
    }

    /// Read from session metadata. Missing or unreadable state starts fresh.
    pub fn from_metadata(metadata: &serde_json::Map<String, serde_json::Value>) -> Self {
        metadata
            .get(STATE_METADATA_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut patch = serde_json::Map::new();
        patch.insert(
            STATE_METADATA_KEY.into(),
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        );
        patch
    }
}

/// What compression did on one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionReport {
    pub mode: CompressionMode,
    pub budget: usize,
    /// Tokens of the full history before compression.
    pub before_tokens: usize,
    /// Tokens of the output (facts section, hint, verbatim turns).
    pub tokens: usize,
    pub kept_turns: usize,
    /// Turns folded into the summary on this call.
    pub folded_turns: usize,
    /// Verbatim turns cut to meet the budget.
    pub dropped_turns: usize,
    pub facts_added: usize,
    pub facts_included: usize,
    pub facts_dropped: usize,
    pub summary_trimmed: bool,
}

#[derive(Debug, Clone)]
pub struct CompressedContext {
    /// Verbatim turns, oldest first.
    pub recent: Vec<Turn>,
    /// Facts to surface, highest salience first.
    pub facts: Vec<MemoryFact>,
    pub summary: Option<String>,
    /// State to persist for the next call.
    pub state: CompressionState,
    pub report: CompressionReport,
}

impl CompressedContext {
    pub fn messages(&self) -> Vec<Message> {
        self.recent.iter().flat_map(Turn::messages).collect()
    }

    pub fn facts_section(&self) -> Option<String> {
        render_facts(&self.facts)
    }

    pub fn hint(&self) -> Option<String> {
        self.summary.as_deref().map(render_hint)
    }

    /// Tokens this context adds to a model request.
    pub fn tokens(&self) -> usize {
        facts_tokens(&self.facts)
            + summary_tokens(self.summary.as_deref())
            + self.recent.iter().map(turn_tokens).sum::<usize>()
    }
}

/// The memory section appended to the system prompt.
pub fn render_facts(facts: &[MemoryFact]) -> Option<String> {
    if facts.is_empty() {
        return None;
    }
    let lines: Vec<String> = facts.iter().map(|f| format!("- {}", f.text)).collect();
    Some(format!("## Memory\n\nKey facts and constraints:\n{}", lines.join("\n")))
}

/// The metadata-only hint message carrying the rolling summary.
pub fn render_hint(summary: &str) -> String {
    format!("{HINT_HEADER}\nRolling summary:\n{summary}")
}

/// The facts section is joined onto the system prompt with a blank line.
fn facts_tokens(facts: &[MemoryFact]) -> usize {
    render_facts(facts).map_or(0, |s| token::estimate_tokens(&s) + 1)
}

fn summary_tokens(summary: Option<&str>) -> usize {
    summary.map_or(0, |s| MESSAGE_OVERHEAD + token::estimate_tokens(&render_hint(s)))
}

fn turn_tokens(turn: &Turn) -> usize {
    token::estimate_messages_tokens(&turn.messages())
}

/// Keyword salience of one message. In `[0, 1]`.
pub fn salience_score(role: Role, text: &str) -> f32 {
    let mut score: f32 = 0.15;
    match role {
        Role::User => score += 0.2,
        Role::Assistant => score += 0.1,
        Role::System | Role::Tool => {}
    }
    let lowered = text.to_lowercase();
    let hits = SALIENCE_KEYWORDS.iter().filter(|kw| lowered.contains(*kw)).count();
    score += (0.08 * hits as f32).min(0.4);
    if text.chars().any(|c| c.is_ascii_digit()) {
        score += 0.1;
    }
    if text.contains('`') {
        score += 0.1;
    }
    if text.chars().count() > FACT_SNIPPET_CHARS {
        score += 0.1;
    }
    score.min(1.0)
}

// ── Stage strategies ──────────────────────────────────────────────────────

/// Pulls salient facts out of turns leaving the recency window.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, turns: &[Turn], max_facts: usize) -> Result<Vec<MemoryFact>, CompressionError>;
}

/// Folds digests of newly excluded turns into the rolling summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn fold(&self, previous: &str, digests: &[String], max_chars: usize) -> Result<String, CompressionError>;
}

/// Deterministic keyword scoring. Facts carry the source turn's start time,
/// so extracting the same turns twice yields identical batches.
#[derive(Debug, Clone)]
pub struct HeuristicFactExtractor {
    pub threshold: f32,
}

impl HeuristicFactExtractor {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn candidates(turn: &Turn) -> Vec<(Role, &str)> {
        let mut out = vec![(Role::User, turn.user_message.as_str())];
        for step in &turn.steps {
            match &step.kind {
                StepKind::Text { text } => out.push((Role::Assistant, text.as_str())),
                StepKind::ToolCalls { thought, invocations } => {
                    if let Some(thought) = thought {
                        out.push((Role::Assistant, thought.as_str()));
                    }
                    out.extend(invocations.iter().map(|inv| (Role::Tool, inv.output.as_str())));
                }
            }
        }
        out
    }
}

#[async_trait]
impl FactExtractor for HeuristicFactExtractor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract(&self, turns: &[Turn], max_facts: usize) -> Result<Vec<MemoryFact>, CompressionError> {
        let mut scored: Vec<(f32, MemoryFact)> = Vec::new();
        for turn in turns {
            for (role, text) in Self::candidates(turn) {
                if text.trim().is_empty() {
                    continue;
                }
                let score = salience_score(role, text);
                if score < self.threshold {
                    continue;
                }
                let mut fact = MemoryFact::new(snippet(text, FACT_SNIPPET_CHARS), score)
                    .from_turn(turn.id.clone());
                fact.created_at = turn.started_at;
                scored.push((score, fact));
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut seen = std::collections::HashSet::new();
        Ok(scored
            .into_iter()
            .map(|(_, fact)| fact)
            .filter(|fact| seen.insert(fact.normalized()))
            .take(max_facts)
            .collect())
    }
}

/// Keeps the newest digest lines that fit in `max_chars`.
#[derive(Debug, Clone, Default)]
pub struct HeuristicSummarizer;

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn fold(&self, previous: &str, digests: &[String], max_chars: usize) -> Result<String, CompressionError> {
        let mut lines: Vec<String> = previous
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        lines.extend(digests.iter().map(|d| format!("- {}", snippet(d, max_chars.saturating_sub(2)))));

        let mut kept: Vec<&str> = Vec::new();
        let mut used = 0;
        for line in lines.iter().rev() {
            let cost = line.chars().count() + usize::from(!kept.is_empty());
            if used + cost > max_chars {
                break;
            }
            used += cost;
            kept.push(line);
        }
        kept.reverse();
        Ok(kept.join("\n"))
    }
}

fn transcript(turns: &[Turn]) -> String {
    let mut lines = Vec::new();
    for turn in turns {
        for msg in turn.messages() {
            if msg.content.trim().is_empty() {
                continue;
            }
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
                Role::Tool => "tool",
            };
            lines.push(format!("{role}: {}", snippet(&msg.content, 400)));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    text: String,
    #[serde(default = "default_model_salience")]
    salience: f32,
}

fn default_model_salience() -> f32 {
    0.7
}

/// Asks the model for a JSON array of `{text, salience}` objects.
pub struct ModelFactExtractor {
    provider: Arc<dyn Provider>,
    sampling: SamplingConfig,
}

impl ModelFactExtractor {
    pub fn new(provider: Arc<dyn Provider>, sampling: SamplingConfig) -> Self {
        Self { provider, sampling }
    }
}

#[async_trait]
impl FactExtractor for ModelFactExtractor {
    fn name(&self) -> &str {
        "model"
    }

    async fn extract(&self, turns: &[Turn], max_facts: usize) -> Result<Vec<MemoryFact>, CompressionError> {
        let Some(last) = turns.last() else {
            return Ok(Vec::new());
        };
        let prompt = format!(
            "Extract at most {max_facts} durable facts, constraints, decisions or preferences from \
             this conversation excerpt. Reply with only a JSON array of objects with fields \
             \"text\" (one sentence) and \"salience\" (0 to 1).\n\n{}",
            transcript(turns)
        );
        let request = ProviderRequest::new(
            &self.sampling,
            vec![
                Message::system("You maintain a compact long-term memory for an assistant."),
                Message::user(prompt),
            ],
            Vec::new(),
        );
        let response = self.provider.complete(request).await?;
        let content = response.message.content;
        let (Some(start), Some(end)) = (content.find('['), content.rfind(']')) else {
            return Err(CompressionError::Malformed("no JSON array in fact list".into()));
        };
        if end < start {
            return Err(CompressionError::Malformed("no JSON array in fact list".into()));
        }
        let parsed: Vec<ExtractedFact> = serde_json::from_str(&content[start..=end])
            .map_err(|e| CompressionError::Malformed(e.to_string()))?;

        Ok(parsed
            .into_iter()
            .filter(|f| !f.text.trim().is_empty())
            .take(max_facts)
            .map(|f| {
                let mut fact = MemoryFact::new(snippet(&f.text, FACT_SNIPPET_CHARS), f.salience)
                    .from_turn(last.id.clone());
                fact.created_at = last.started_at;
                fact
            })
            .collect())
    }
}

/// Asks the model to rewrite the summary with the new digests folded in.
pub struct ModelSummarizer {
    provider: Arc<dyn Provider>,
    sampling: SamplingConfig,
}

impl ModelSummarizer {
    pub fn new(provider: Arc<dyn Provider>, sampling: SamplingConfig) -> Self {
        Self { provider, sampling }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    fn name(&self) -> &str {
        "model"
    }

    async fn fold(&self, previous: &str, digests: &[String], max_chars: usize) -> Result<String, CompressionError> {
        let previous = if previous.trim().is_empty() { "(none)" } else { previous };
        let prompt = format!(
            "Previous summary:\n{previous}\n\nNewly archived turns:\n{}\n\n\
             Write an updated summary of the whole conversation in at most {max_chars} characters. \
             Keep decisions, open tasks and constraints. Reply with the summary only.",
            digests.iter().map(|d| format!("- {d}")).collect::<Vec<_>>().join("\n")
        );
        let request = ProviderRequest::new(
            &self.sampling,
            vec![
                Message::system("You keep a rolling summary of a conversation."),
                Message::user(prompt),
            ],
            Vec::new(),
        );
        let response = self.provider.complete(request).await?;
        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(CompressionError::Malformed("empty summary".into()));
        }
        Ok(summary.chars().take(max_chars).collect())
    }
}

// ── Compressor ────────────────────────────────────────────────────────────

pub struct ContextCompressor {
    config: CompressionConfig,
    memory: Arc<dyn MemoryStore>,
    extractor: Arc<dyn FactExtractor>,
    summarizer: Arc<dyn Summarizer>,
    events: Option<Arc<EventBus>>,
}

impl ContextCompressor {
    /// Heuristic stages; no model calls.
    pub fn new(config: CompressionConfig, memory: Arc<dyn MemoryStore>) -> Self {
        let threshold = config.salience_threshold;
        Self {
            config,
            memory,
            extractor: Arc::new(HeuristicFactExtractor::new(threshold)),
            summarizer: Arc::new(HeuristicSummarizer),
            events: None,
        }
    }

    /// Model-backed stages, falling back to heuristics on failure.
    pub fn with_model(mut self, provider: Arc<dyn Provider>, sampling: SamplingConfig) -> Self {
        self.extractor = Arc::new(ModelFactExtractor::new(provider.clone(), sampling.clone()));
        self.summarizer = Arc::new(ModelSummarizer::new(provider, sampling));
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    /// Compress `history` (oldest first, current turn excluded) to at most
    /// `budget` tokens plus the configured overrun tolerance.
    ///
    /// Memory and model failures are logged and degrade the result; they
    /// never fail the call.
    pub async fn compress(
        &self,
        session: &SessionKey,
        history: &[Turn],
        budget: usize,
        state: &CompressionState,
    ) -> CompressedContext {
        let cfg = self.config.effective();
        let before_tokens: usize = history.iter().map(turn_tokens).sum();
        let mut report = CompressionReport {
            mode: cfg.mode,
            budget,
            before_tokens,
            ..Default::default()
        };

        let (recent, facts, summary, next_state) = if cfg.mode == CompressionMode::Off {
            (history.to_vec(), Vec::new(), None, state.clone())
        } else {
            let split = history.len().saturating_sub(cfg.recency_turns);
            let cursor = state.cursor(history).min(split);
            let newly_aged = &history[cursor..split];

            let mut next_state = state.clone();
            next_state.advance(newly_aged);
            let mut extracted = Vec::new();
            if !newly_aged.is_empty() {
                extracted = self.extract_facts(newly_aged, cfg.max_facts).await;
                match self.memory.upsert_facts(session, extracted.clone()).await {
                    Ok(merge) => report.facts_added = merge.added,
                    Err(e) => warn!(session = %session, error = %e, "Failed to merge extracted facts"),
                }
                let digests: Vec<String> = newly_aged
                    .iter()
                    .map(|t| HistoryEntry::from_turn(t).digest)
                    .collect();
                next_state.summary = self.fold_summary(&state.summary, &digests, cfg.max_summary_chars).await;
                report.folded_turns = newly_aged.len();
            }

            let facts: Vec<MemoryFact> = match self.memory.load_facts_snapshot(session).await {
                Ok(snapshot) => snapshot.ranked().into_iter().take(cfg.max_facts).cloned().collect(),
                Err(e) => {
                    warn!(session = %session, error = %e, "Failed to load facts snapshot");
                    extracted.truncate(cfg.max_facts);
                    extracted
                }
            };
            let summary = Some(next_state.summary.clone()).filter(|s| !s.trim().is_empty());
            (history[split..].to_vec(), facts, summary, next_state)
        };

        let mut ctx = CompressedContext {
            recent,
            facts,
            summary,
            state: next_state,
            report,
        };
        self.fit_to_budget(session, &mut ctx, budget + cfg.overrun_tolerance_tokens);

        ctx.report.kept_turns = ctx.recent.len();
        ctx.report.facts_included = ctx.facts.len();
        ctx.report.tokens = ctx.tokens();
        debug!(
            session = %session,
            mode = ?cfg.mode,
            kept = ctx.report.kept_turns,
            folded = ctx.report.folded_turns,
            tokens = ctx.report.tokens,
            budget,
            "Compressed history"
        );

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ContextCompressed {
                session: session.to_string(),
                kept_turns: ctx.report.kept_turns,
                folded_turns: ctx.report.folded_turns,
                dropped_turns: ctx.report.dropped_turns,
                facts_added: ctx.report.facts_added,
                tokens: ctx.report.tokens,
                budget,
                timestamp: chrono::Utc::now(),
            });
        }
        ctx
    }

    async fn extract_facts(&self, turns: &[Turn], max_facts: usize) -> Vec<MemoryFact> {
        match self.extractor.extract(turns, max_facts).await {
            Ok(facts) => return facts,
            Err(e) => warn!(extractor = self.extractor.name(), error = %e, "Fact extraction failed, using heuristics"),
        }
        HeuristicFactExtractor::new(self.config.salience_threshold)
            .extract(turns, max_facts)
            .await
            .unwrap_or_default()
    }

    async fn fold_summary(&self, previous: &str, digests: &[String], max_chars: usize) -> String {
        match self.summarizer.fold(previous, digests, max_chars).await {
            Ok(summary) => return summary,
            Err(e) => warn!(summarizer = self.summarizer.name(), error = %e, "Summary fold failed, using heuristics"),
        }
        HeuristicSummarizer
            .fold(previous, digests, max_chars)
            .await
            .unwrap_or_else(|_| previous.to_string())
    }

    /// Cut oldest verbatim turns, then the summary, then the weakest facts.
    fn fit_to_budget(&self, session: &SessionKey, ctx: &mut CompressedContext, limit: usize) {
        if ctx.tokens() <= limit {
            return;
        }

        while ctx.tokens() > limit && !ctx.recent.is_empty() {
            let dropped = ctx.recent.remove(0);
            ctx.report.dropped_turns += 1;
            warn!(
                session = %session,
                turn_id = %dropped.id,
                "Dropped unsummarized verbatim turn to fit token budget"
            );
        }

        if ctx.tokens() > limit {
            if let Some(summary) = ctx.summary.take() {
                let rest = facts_tokens(&ctx.facts);
                let available = limit.saturating_sub(rest);
                let max_tokens = available
                    .saturating_sub(MESSAGE_OVERHEAD)
                    .saturating_sub(token::estimate_tokens(&render_hint("")));
                let kept = token::tail_to_tokens(&summary, max_tokens).trim_start();
                ctx.report.summary_trimmed = true;
                if !kept.is_empty() {
                    ctx.summary = Some(kept.to_string());
                }
                warn!(
                    session = %session,
                    before = summary.len(),
                    after = kept.len(),
                    "Trimmed rolling summary to fit token budget"
                );
            }
        }

        while ctx.tokens() > limit && !ctx.facts.is_empty() {
            if let Some(fact) = ctx.facts.pop() {
                ctx.report.facts_dropped += 1;
                warn!(
                    session = %session,
                    fact = %redact::preview(&fact.text, 80),
                    "Dropped memory fact to fit token budget"
                );
            }
        }
    }
}
