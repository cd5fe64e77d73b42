//! The turn orchestrator.
//!
//! One call to [`ConversationOrchestrator::run_turn`] drives one turn through
//! an explicit state machine:
//!
//! ```text
//! Building ─► AwaitingModel ─┬─► TextDone ─► Done
//!                 ▲          └─► ExecutingTools ─┐
//!                 └──────────────────────────────┘
//! any non-terminal state ─► Cancelled | BudgetExhausted | Error
//! ```
//!
//! Every terminal state seals the turn and persists it, partial steps
//! included.
//!
//! With interrupts enabled, user messages that arrive while the turn runs are
//! queued on the bus. Before each model call the queue is drained into the
//! conversation. Before each tool call a non-empty queue cancels the calls
//! still pending, and the events are delivered on the next model call.

use crate::context::{BuildRequest, ContextBuilder, RuntimeContext};
use crate::guard::{fingerprint, CacheStatus, LoopGuard, Nudge, ToolCallCache};
use crate::prompt_guard::wrap_tool_result;
use crate::stream_event::{extract_plan, tool_hint, ProgressSink, TurnEvent};
use crate::think::strip_reasoning;
use chrono::Utc;
use snapclaw_core::agent::AgentConfig;
use snapclaw_core::bus::{format_events, MessageBus};
use snapclaw_core::error::Result;
use snapclaw_core::event::{DomainEvent, EventBus};
use snapclaw_core::message::{Message, MessageToolCall};
use snapclaw_core::provider::{ModelReply, Provider, ProviderRequest, SamplingConfig};
use snapclaw_core::redact;
use snapclaw_core::session::{Session, SessionKey, SessionStore};
use snapclaw_core::tool::ToolCapability;
use snapclaw_core::turn::{
    Step, StepKind, ToolInvocation, Turn, TurnId, TurnOrigin, TurnOutcome, TurnState,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";

pub const INTERRUPTED_OUTPUT: &str = "CANCELLED: User interrupted";

/// System notice that precedes user events delivered mid-turn.
pub fn interrupt_notice(events: &str) -> String {
    format!("<SYS_EVENT type=\"user_interrupt\">\n{events}\n</SYS_EVENT>")
}

pub fn budget_exhausted_message(max_iterations: u32) -> String {
    format!(
        "I reached the maximum number of tool call iterations ({max_iterations}) without completing \
         the task. You can try breaking the task into smaller steps."
    )
}

/// Reply for a turn that ran out of iterations: the last model text, if there
/// was any, followed by the budget notice.
pub fn budget_exhausted_reply(partial: Option<&str>, max_iterations: u32) -> String {
    let notice = budget_exhausted_message(max_iterations);
    match partial {
        Some(text) => format!("{text}\n\n({notice})"),
        None => notice,
    }
}

/// Cut persisted tool output to `max_chars`.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{kept}\n... (truncated)")
}

/// Everything that starts a turn besides the session itself.
#[derive(Debug, Clone)]
pub struct TurnInput {
    /// Id the turn will carry. Generated up front so per-turn tools (such as
    /// `spawn`) can be bound to it before the turn starts.
    pub turn_id: TurnId,
    pub message: String,
    pub origin: TurnOrigin,
    pub parent_turn: Option<TurnId>,
    pub progress: Option<ProgressSink>,
}

impl TurnInput {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            turn_id: TurnId::new(),
            message: message.into(),
            origin: TurnOrigin::User,
            parent_turn: None,
            progress: None,
        }
    }

    pub fn system(source: &str, message: impl Into<String>) -> Self {
        Self {
            origin: TurnOrigin::System { source: source.to_string() },
            ..Self::user(message)
        }
    }

    pub fn with_parent(mut self, parent: TurnId) -> Self {
        self.parent_turn = Some(parent);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Tool calls returned by the model, waiting to run.
struct PendingCalls {
    thought: Option<String>,
    calls: Vec<MessageToolCall>,
    nudge: Option<String>,
    interrupts: Vec<String>,
    usage: Option<snapclaw_core::provider::Usage>,
}

/// Mutable state of one running turn. Dropped with the turn, which is what
/// keeps the cache and the loop guard turn-scoped.
struct TurnRun {
    messages: Vec<Message>,
    cache: ToolCallCache,
    guard: LoopGuard,
    pending_nudge: Option<Nudge>,
    pending_calls: Option<PendingCalls>,
    /// Events taken off the bus that the model has not seen yet.
    pending_events: Vec<String>,
    final_text: Option<String>,
    best_text: Option<String>,
    progress: Option<ProgressSink>,
}

impl TurnRun {
    fn emit(&self, event: TurnEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

pub struct ConversationOrchestrator {
    provider: Arc<dyn Provider>,
    sessions: Arc<dyn SessionStore>,
    builder: Arc<ContextBuilder>,
    config: AgentConfig,
    sampling: SamplingConfig,
    events: Arc<EventBus>,
    interrupts: Option<MessageBus>,
}

impl ConversationOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, sessions: Arc<dyn SessionStore>, builder: Arc<ContextBuilder>) -> Self {
        Self {
            provider,
            sessions,
            builder,
            config: AgentConfig::default(),
            sampling: SamplingConfig::default(),
            events: Arc::new(EventBus::default()),
            interrupts: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Deliver events queued on `bus` for the turn's session while the turn
    /// runs.
    pub fn with_interrupts(mut self, bus: MessageBus) -> Self {
        self.interrupts = Some(bus);
        self
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.is_some()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn builder(&self) -> &Arc<ContextBuilder> {
        &self.builder
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run one turn to a terminal state and persist it.
    ///
    /// Provider, tool and context failures end up in the turn's
    /// [`TurnOutcome`]; only a failure to persist the turn is returned as
    /// `Err`.
    pub async fn run_turn(
        &self,
        session: &Session,
        input: TurnInput,
        tools: &dyn ToolCapability,
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        let mut turn = Turn::new(session.key.clone(), session.mode, input.message.clone())
            .with_origin(input.origin.clone());
        turn.id = input.turn_id.clone();
        if let Some(parent) = input.parent_turn.clone() {
            turn = turn.with_parent(parent);
        }
        info!(session = %session.key, turn_id = %turn.id, mode = %session.mode, "Turn started");
        self.events.publish(DomainEvent::TurnStarted {
            session: session.key.to_string(),
            turn_id: turn.id.to_string(),
            timestamp: Utc::now(),
        });

        let definitions = tools.definitions();
        let mut run = TurnRun {
            messages: Vec::new(),
            cache: ToolCallCache::with_search_tools(self.config.search_tools.clone()),
            guard: LoopGuard::new(
                self.config.loop_window,
                self.config.search_tools.clone(),
                self.config.max_searches_per_turn,
            ),
            pending_nudge: None,
            pending_calls: None,
            pending_events: Vec::new(),
            final_text: None,
            best_text: None,
            progress: input.progress.clone(),
        };

        let mut state = TurnState::Building;
        while !state.is_terminal() {
            state = match state {
                TurnState::Building => {
                    self.build_context(session, &input, &definitions, &mut run, &mut turn, cancel)
                        .await
                }
                TurnState::AwaitingModel => self.call_model(&definitions, &mut run, &mut turn, cancel).await,
                TurnState::TextDone => {
                    let reply = run.final_text.take().unwrap_or_else(|| EMPTY_REPLY.to_string());
                    turn.seal(TurnOutcome::Completed { reply });
                    TurnState::Done
                }
                TurnState::ExecutingTools => self.execute_tools(tools, &mut run, &mut turn, cancel).await,
                terminal => terminal,
            };
            debug!(turn_id = %turn.id, state = ?state, "Turn state");
        }

        if let Some(bus) = &self.interrupts {
            let undelivered = std::mem::take(&mut run.pending_events);
            if state == TurnState::Cancelled {
                if !undelivered.is_empty() {
                    debug!(turn_id = %turn.id, events = undelivered.len(), "Dropping events of a cancelled turn");
                }
            } else {
                bus.requeue_events(&session.key, undelivered);
            }
        }

        self.sessions.append_turn(&session.key, &turn).await?;

        let outcome = turn.outcome.as_ref().map_or("open", |o| o.label());
        info!(
            session = %session.key,
            turn_id = %turn.id,
            outcome,
            iterations = turn.iterations,
            tokens = turn.usage.total_tokens,
            "Turn finished"
        );
        self.events.publish(DomainEvent::TurnFinished {
            session: session.key.to_string(),
            turn_id: turn.id.to_string(),
            outcome: outcome.to_string(),
            iterations: turn.iterations,
            tokens_used: turn.usage.total_tokens,
            timestamp: Utc::now(),
        });
        run.emit(TurnEvent::Done {
            turn_id: turn.id.to_string(),
            outcome: outcome.to_string(),
            iterations: turn.iterations,
            usage: turn.usage,
        });
        Ok(turn)
    }

    async fn build_context(
        &self,
        session: &Session,
        input: &TurnInput,
        definitions: &[snapclaw_core::provider::ToolDefinition],
        run: &mut TurnRun,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> TurnState {
        if cancel.is_cancelled() {
            turn.seal(TurnOutcome::Cancelled);
            return TurnState::Cancelled;
        }

        let request = BuildRequest {
            session,
            user_message: &input.message,
            runtime: RuntimeContext::for_session(session, input.origin.clone()),
            tools: definitions,
            context_window: self.config.context_window,
        };
        let context = match self.builder.build(request).await {
            Ok(context) => context,
            Err(e) => {
                warn!(session = %session.key, error = %e, "Context assembly failed");
                self.events.publish(DomainEvent::ErrorOccurred {
                    context: format!("context:{}", session.key),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                turn.seal(TurnOutcome::Failed {
                    error: e.to_string(),
                    code: "context_budget".into(),
                    partial_reply: None,
                });
                return TurnState::Error;
            }
        };

        let previous = crate::context::CompressionState::from_metadata(&session.metadata);
        if context.compression_state != previous {
            if let Err(e) = self
                .sessions
                .write_metadata(&session.key, context.compression_state.to_metadata())
                .await
            {
                warn!(session = %session.key, error = %e, "Failed to persist compression state");
            }
        }
        debug!(
            session = %session.key,
            tokens = context.metadata.total_tokens,
            budget = context.metadata.budget,
            "Context assembled"
        );

        run.messages = context.messages;
        TurnState::AwaitingModel
    }

    async fn call_model(
        &self,
        definitions: &[snapclaw_core::provider::ToolDefinition],
        run: &mut TurnRun,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> TurnState {
        if turn.iterations >= self.config.max_iterations {
            warn!(turn_id = %turn.id, max = self.config.max_iterations, "Iteration budget exhausted");
            turn.seal(TurnOutcome::BudgetExhausted {
                reply: budget_exhausted_reply(run.best_text.as_deref(), self.config.max_iterations),
            });
            return TurnState::BudgetExhausted;
        }
        if cancel.is_cancelled() {
            info!(turn_id = %turn.id, iteration = turn.iterations, "Turn cancelled before model call");
            turn.seal(TurnOutcome::Cancelled);
            return TurnState::Cancelled;
        }

        turn.iterations += 1;
        let iteration = turn.iterations;
        let nudge = run.pending_nudge.take();
        if let Some(nudge) = &nudge {
            run.messages.push(Message::system(nudge.message.clone()));
        }
        let mut interrupts = std::mem::take(&mut run.pending_events);
        interrupts.extend(self.queued_events(&turn.session_key));
        if let Some(events) = format_events(&interrupts) {
            info!(turn_id = %turn.id, iteration, events = interrupts.len(), "Delivering user events");
            run.messages.push(Message::system(interrupt_notice(&events)));
            run.messages.push(Message::user(events));
        }

        let request = ProviderRequest::new(&self.sampling, run.messages.clone(), definitions.to_vec());
        let response = match self.provider.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(turn_id = %turn.id, iteration, error = %e, "Provider call failed");
                self.events.publish(DomainEvent::ErrorOccurred {
                    context: format!("provider:{}", self.provider.name()),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                turn.seal(TurnOutcome::Failed {
                    error: e.to_string(),
                    code: e.code().to_string(),
                    partial_reply: run.best_text.clone(),
                });
                run.pending_events = interrupts;
                return TurnState::Error;
            }
        };
        if let Some(usage) = &response.usage {
            turn.usage.add(usage);
        }

        match response.reply() {
            ModelReply::Text(text) => {
                let text = self.clean(&text);
                debug!(turn_id = %turn.id, iteration, "Model returned final text");
                turn.push_step(Step {
                    index: iteration,
                    kind: StepKind::Text { text: text.clone().unwrap_or_default() },
                    nudge: nudge.map(|n| n.message),
                    interrupts,
                    usage: response.usage,
                    timestamp: Utc::now(),
                });
                run.final_text = text;
                TurnState::TextDone
            }
            ModelReply::ToolCalls { thought, calls } => {
                let thought = thought.and_then(|t| self.clean(&t));
                if let Some(t) = &thought {
                    run.best_text = Some(t.clone());
                }
                debug!(turn_id = %turn.id, iteration, calls = calls.len(), "Model requested tools");
                run.pending_calls = Some(PendingCalls {
                    thought,
                    calls,
                    nudge: nudge.map(|n| n.message),
                    interrupts,
                    usage: response.usage,
                });
                TurnState::ExecutingTools
            }
        }
    }

    async fn execute_tools(
        &self,
        tools: &dyn ToolCapability,
        run: &mut TurnRun,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> TurnState {
        let Some(pending) = run.pending_calls.take() else {
            return TurnState::AwaitingModel;
        };
        let step = turn.iterations;

        if let Some(thought) = &pending.thought {
            run.emit(TurnEvent::Thought { step, content: thought.clone() });
            if let Some(plan) = extract_plan(thought) {
                run.emit(TurnEvent::Plan { step, content: plan });
            }
        }
        run.emit(TurnEvent::ToolHint { step, hint: tool_hint(&pending.calls, step) });

        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut observations: Vec<(MessageToolCall, String)> = Vec::new();
        let mut cancelled = false;
        let mut interrupted = false;
        for (index, call) in pending.calls.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    turn_id = %turn.id,
                    completed = invocations.len(),
                    skipped = pending.calls.len() - invocations.len(),
                    "Turn cancelled between tool calls"
                );
                cancelled = true;
                break;
            }
            let events = self.queued_events(&turn.session_key);
            if !events.is_empty() {
                info!(
                    turn_id = %turn.id,
                    events = events.len(),
                    skipped = pending.calls.len() - index,
                    "User event arrived, cancelling pending tool calls"
                );
                run.pending_events.extend(events);
                for skipped in &pending.calls[index..] {
                    invocations.push(interrupted_invocation(skipped));
                    observations.push((skipped.clone(), INTERRUPTED_OUTPUT.to_string()));
                }
                interrupted = true;
                break;
            }

            let (invocation, full_output) = self.resolve_call(&turn.session_key.to_string(), call, tools, run).await;
            run.emit(TurnEvent::ToolResult {
                step,
                name: invocation.name.clone(),
                success: invocation.success,
                cached: invocation.cached,
            });
            // Only the window as it stands after the last call counts.
            run.pending_nudge = run.guard.observe(&call.name);
            let observation = if self.builder.content_tagging() {
                wrap_tool_result(&full_output, &call.name)
            } else {
                full_output
            };
            observations.push((call.clone(), observation));
            invocations.push(invocation);
        }

        if interrupted {
            run.pending_nudge = None;
        }
        if let Some(nudge) = &run.pending_nudge {
            info!(turn_id = %turn.id, tool = %nudge.tool_name, "Repeated tool pattern, nudging");
            self.events.publish(DomainEvent::LoopNudge {
                session: turn.session_key.to_string(),
                tool_name: nudge.tool_name.clone(),
                timestamp: Utc::now(),
            });
            run.emit(TurnEvent::Nudge { step, message: nudge.message.clone() });
        }

        if !observations.is_empty() {
            let calls = observations.iter().map(|(call, _)| call.clone()).collect();
            run.messages.push(Message::assistant_tool_calls(
                pending.thought.clone().unwrap_or_default(),
                calls,
            ));
            for (call, output) in observations {
                run.messages.push(Message::tool_result(call.id, output));
            }
        }

        turn.push_step(Step {
            index: step,
            kind: StepKind::ToolCalls {
                thought: pending.thought,
                invocations,
            },
            nudge: pending.nudge,
            interrupts: pending.interrupts,
            usage: pending.usage,
            timestamp: Utc::now(),
        });

        if cancelled {
            turn.seal(TurnOutcome::Cancelled);
            return TurnState::Cancelled;
        }
        TurnState::AwaitingModel
    }

    /// Resolve one call: cache hit, blocked search, or a real invocation.
    /// Returns the persisted invocation and the full output shown to the model.
    async fn resolve_call(
        &self,
        session: &str,
        call: &MessageToolCall,
        tools: &dyn ToolCapability,
        run: &mut TurnRun,
    ) -> (ToolInvocation, String) {
        let started = Instant::now();
        let max_chars = self.config.tool_result_max_chars;

        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Unparseable tool arguments");
                let output = format!("Error: invalid arguments for {}: {e}", call.name);
                let invocation = ToolInvocation {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: serde_json::Value::String(call.arguments.clone()),
                    fingerprint: fingerprint(&call.name, &serde_json::Value::String(call.arguments.clone())),
                    output: truncate_output(&output, max_chars),
                    success: false,
                    cached: false,
                    error_code: Some("invalid_arguments".into()),
                };
                return (invocation, output);
            }
        };

        let key = run.cache.key_for(&call.name, &arguments);
        let already_cached = run.cache.get(&key.fingerprint).is_some();

        let (output, success, cached, error_code) = if !already_cached && !run.guard.search_allowed(&call.name) {
            info!(tool = %call.name, searches = run.guard.search_count(), "Search cap reached, call blocked");
            (run.guard.blocked_observation(), false, false, Some("search_cap".to_string()))
        } else {
            let (outcome, status) = run
                .cache
                .get_or_compute(&key, || tools.invoke(&call.name, arguments.clone()))
                .await;
            if status == CacheStatus::Miss {
                run.guard.record_search(&call.name, &arguments);
            }
            let cached = status == CacheStatus::Hit;
            match outcome {
                Ok(result) => (result.output, result.success, cached, None),
                Err(e) => {
                    if !cached {
                        warn!(tool = %call.name, error = %e, "Tool execution failed");
                    }
                    (format!("Error: {e}"), false, cached, Some(e.code().to_string()))
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            tool = %call.name,
            args = %redact::redact_value(&arguments),
            cached,
            success,
            duration_ms,
            "Tool call resolved"
        );
        self.events.publish(DomainEvent::ToolExecuted {
            session: session.to_string(),
            tool_name: call.name.clone(),
            success,
            cached,
            duration_ms,
            timestamp: Utc::now(),
        });

        let invocation = ToolInvocation {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments,
            fingerprint: key.exact,
            output: truncate_output(&output, max_chars),
            success,
            cached,
            error_code,
        };
        (invocation, output)
    }

    fn queued_events(&self, session: &SessionKey) -> Vec<String> {
        self.interrupts
            .as_ref()
            .map(|bus| bus.drain_events(session))
            .unwrap_or_default()
    }

    fn clean(&self, text: &str) -> Option<String> {
        if self.config.strip_reasoning {
            return strip_reasoning(text);
        }
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Record for a call that never ran because the user spoke first.
fn interrupted_invocation(call: &MessageToolCall) -> ToolInvocation {
    let arguments = call
        .parsed_arguments()
        .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone()));
    ToolInvocation {
        call_id: call.id.clone(),
        name: call.name.clone(),
        fingerprint: fingerprint(&call.name, &arguments),
        arguments,
        output: INTERRUPTED_OUTPUT.to_string(),
        success: false,
        cached: false,
        error_code: Some("interrupted".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextCompressor;
    use crate::test_helpers::*;
    use serde_json::json;
    use snapclaw_core::agent::CompressionConfig;
    use snapclaw_core::error::ProviderError;
    use snapclaw_core::identity::Identity;
    use snapclaw_core::session::SessionKey;
    use snapclaw_core::tool::ToolRegistry;
    use snapclaw_memory::{InMemorySessionStore, InMemoryStore};

    fn orchestrator(provider: Arc<SequentialMockProvider>) -> (ConversationOrchestrator, Arc<InMemorySessionStore>) {
        let sessions = Arc::new(InMemorySessionStore::default());
        let compressor = ContextCompressor::new(CompressionConfig::default(), Arc::new(InMemoryStore::new()));
        let builder = ContextBuilder::new(Identity::with_prompt("Test", "You are a test agent."), Arc::new(compressor));
        let orch = ConversationOrchestrator::new(provider, sessions.clone(), Arc::new(builder));
        (orch, sessions)
    }

    fn session() -> Session {
        Session::new(SessionKey::new("cli", "test"))
    }

    #[tokio::test]
    async fn text_reply_completes_turn() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello!"));
        let (orch, sessions) = orchestrator(provider.clone());
        let turn = orch
            .run_turn(&session(), TurnInput::user("Hi"), &ToolRegistry::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.outcome, Some(TurnOutcome::Completed { reply: "Hello!".into() }));
        assert_eq!(turn.iterations, 1);
        assert_eq!(turn.usage.total_tokens, 15);
        let stored = sessions.get_or_create(&SessionKey::new("cli", "test")).await.unwrap();
        assert_eq!(stored.turns.len(), 1);
    }

    #[tokio::test]
    async fn tool_then_answer() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "read_file", json!({"path": "a.txt"}))], "Reading"),
            make_text_response("The file says hi"),
        ]));
        let tool = Arc::new(CountingTool::new("read_file"));
        let tools = ToolRegistry::new().with(tool.clone());
        let (orch, _) = orchestrator(provider.clone());

        let turn = orch
            .run_turn(&session(), TurnInput::user("read a.txt"), &tools, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.reply(), Some("The file says hi"));
        assert_eq!(turn.steps.len(), 2);
        assert_eq!(tool.calls(), 1);
        let requests = provider.requests();
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert!(last.content.starts_with("[-- BEGIN UNTRUSTED CONTENT: tool:read_file --]\n"));
        assert!(last.content.ends_with("\n[-- END UNTRUSTED CONTENT: tool:read_file --]"));
        // History keeps the raw output.
        assert!(!turn.invocations().next().unwrap().output.contains("UNTRUSTED"));
    }

    #[tokio::test]
    async fn untagged_tool_output_is_raw() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "read_file", json!({"path": "a.txt"}))], ""),
            make_text_response("ok"),
        ]));
        let compressor = ContextCompressor::new(CompressionConfig::default(), Arc::new(InMemoryStore::new()));
        let builder = ContextBuilder::new(Identity::default(), Arc::new(compressor)).with_content_tagging(false);
        let orch = ConversationOrchestrator::new(provider.clone(), Arc::new(InMemorySessionStore::default()), Arc::new(builder));
        let tools = ToolRegistry::new().with(Arc::new(CountingTool::new("read_file")));

        orch.run_turn(&session(), TurnInput::user("read"), &tools, &CancellationToken::new())
            .await
            .unwrap();
        let requests = provider.requests();
        assert!(!requests[1].messages.last().unwrap().content.contains("UNTRUSTED"));
    }

    #[tokio::test]
    async fn tool_errors_become_observations() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![
                    make_tool_call("c1", "exec", json!({"cmd": "x"})),
                    make_tool_call("c2", "missing_tool", json!({})),
                ],
                "",
            ),
            make_text_response("Both failed"),
        ]));
        let tools = ToolRegistry::new().with(Arc::new(CountingTool::failing("exec")));
        let (orch, _) = orchestrator(provider);

        let turn = orch
            .run_turn(&session(), TurnInput::user("go"), &tools, &CancellationToken::new())
            .await
            .unwrap();

        let codes: Vec<Option<&str>> = turn.invocations().map(|i| i.error_code.as_deref()).collect();
        assert_eq!(codes, vec![Some("execution_failed"), Some("not_found")]);
        assert!(turn.invocations().all(|i| i.output.starts_with("Error:")));
        assert_eq!(turn.reply(), Some("Both failed"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported() {
        let bad = MessageToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: "{not json".into(),
        };
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![bad], ""),
            make_text_response("sorry"),
        ]));
        let tool = Arc::new(CountingTool::new("read_file"));
        let (orch, _) = orchestrator(provider);
        let turn = orch
            .run_turn(
                &session(),
                TurnInput::user("go"),
                &ToolRegistry::new().with(tool.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(tool.calls(), 0);
        let inv = turn.invocations().next().unwrap();
        assert_eq!(inv.error_code.as_deref(), Some("invalid_arguments"));
    }

    #[tokio::test]
    async fn provider_error_fails_with_partial_text() {
        let provider = Arc::new(SequentialMockProvider::scripted(vec![
            Ok(make_tool_call_response(
                vec![make_tool_call("c1", "read_file", json!({"path": "a"}))],
                "Let me check the file",
            )),
            Err(ProviderError::RateLimited { retry_after_secs: 30 }),
        ]));
        let tools = ToolRegistry::new().with(Arc::new(CountingTool::new("read_file")));
        let (orch, sessions) = orchestrator(provider);

        let turn = orch
            .run_turn(&session(), TurnInput::user("go"), &tools, &CancellationToken::new())
            .await
            .unwrap();

        match turn.outcome.as_ref().unwrap() {
            TurnOutcome::Failed { code, partial_reply, .. } => {
                assert_eq!(code, "rate_limited");
                assert_eq!(partial_reply.as_deref(), Some("Let me check the file"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(turn.steps.len(), 1);
        let stored = sessions.get_or_create(&turn.session_key).await.unwrap();
        assert_eq!(stored.turns[0].steps.len(), 1);
    }

    #[tokio::test]
    async fn reasoning_is_stripped_from_reply() {
        let provider = Arc::new(SequentialMockProvider::single_text("<think>hmm</think>Answer"));
        let (orch, _) = orchestrator(provider);
        let turn = orch
            .run_turn(&session(), TurnInput::user("q"), &ToolRegistry::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.reply(), Some("Answer"));
    }

    #[tokio::test]
    async fn persisted_output_is_truncated() {
        struct Big;
        #[async_trait::async_trait]
        impl snapclaw_core::tool::Tool for Big {
            fn name(&self) -> &str {
                "big"
            }
            fn description(&self) -> &str {
                "big output"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                json!({"type": "object"})
            }
            async fn execute(
                &self,
                _arguments: serde_json::Value,
            ) -> std::result::Result<snapclaw_core::tool::ToolResult, snapclaw_core::error::ToolError> {
                Ok(snapclaw_core::tool::ToolResult::ok("y".repeat(2_000)))
            }
        }

        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "big", json!({}))], ""),
            make_text_response("done"),
        ]));
        let (orch, _) = orchestrator(provider.clone());
        let turn = orch
            .run_turn(
                &session(),
                TurnInput::user("go"),
                &ToolRegistry::new().with(Arc::new(Big)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let inv = turn.invocations().next().unwrap();
        assert!(inv.output.chars().count() < 600);
        assert!(inv.output.ends_with("(truncated)"));
        // The model saw the full output, fenced as untrusted.
        let requests = provider.requests();
        let seen = &requests[1].messages.last().unwrap().content;
        assert!(seen.starts_with("[-- BEGIN UNTRUSTED CONTENT: tool:big --]"));
        assert_eq!(seen.matches('y').count(), 2_000);
    }

    #[tokio::test]
    async fn already_cancelled_turn_makes_no_calls() {
        let provider = Arc::new(SequentialMockProvider::single_text("unused"));
        let (orch, sessions) = orchestrator(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let turn = orch
            .run_turn(&session(), TurnInput::user("q"), &ToolRegistry::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(turn.outcome, Some(TurnOutcome::Cancelled));
        assert_eq!(provider.call_count(), 0);
        let stored = sessions.get_or_create(&turn.session_key).await.unwrap();
        assert_eq!(stored.turns.len(), 1);
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![make_tool_call("c1", "web_search", json!({"query": "rust"}))],
                "**Plan:**\n1. [ ] search\n2. [ ] answer",
            ),
            make_text_response("done"),
        ]));
        let tools = ToolRegistry::new().with(Arc::new(CountingTool::new("web_search")));
        let (orch, _) = orchestrator(provider);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        orch.run_turn(&session(), TurnInput::user("q").with_progress(tx), &tools, &CancellationToken::new())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["thought", "plan", "tool_hint", "tool_result", "done"]);
    }

    #[test]
    fn truncation_helper() {
        assert_eq!(truncate_output("short", 10), "short");
        let cut = truncate_output(&"z".repeat(20), 10);
        assert!(cut.starts_with(&"z".repeat(10)));
        assert!(cut.ends_with("(truncated)"));
    }

    fn interrupting(
        responses: Vec<snapclaw_core::provider::ProviderResponse>,
        event: &str,
    ) -> (ConversationOrchestrator, Arc<InterruptingProvider>, MessageBus) {
        let (bus, _rx) = MessageBus::new(4);
        let provider = Arc::new(InterruptingProvider::new(
            responses,
            bus.clone(),
            SessionKey::new("cli", "test"),
            event,
        ));
        let compressor = ContextCompressor::new(CompressionConfig::default(), Arc::new(InMemoryStore::new()));
        let builder = ContextBuilder::new(Identity::default(), Arc::new(compressor));
        let orch = ConversationOrchestrator::new(provider.clone(), Arc::new(InMemorySessionStore::default()), Arc::new(builder))
            .with_interrupts(bus.clone());
        (orch, provider, bus)
    }

    #[tokio::test]
    async fn queued_event_is_delivered_before_the_model_call() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello"));
        let (bus, _rx) = MessageBus::new(4);
        let (orch, _) = orchestrator(provider.clone());
        let orch = orch.with_interrupts(bus.clone());
        bus.publish_event(&SessionKey::new("cli", "test"), "User interrupt");

        let turn = orch
            .run_turn(&session(), TurnInput::user("test"), &ToolRegistry::new(), &CancellationToken::new())
            .await
            .unwrap();

        let messages = &provider.requests()[0].messages;
        let n = messages.len();
        assert_eq!(messages[n - 2].role, snapclaw_core::message::Role::System);
        assert!(messages[n - 2].content.starts_with("<SYS_EVENT"));
        assert!(messages[n - 2].content.contains("User interrupt"));
        assert_eq!(messages[n - 1].role, snapclaw_core::message::Role::User);
        assert_eq!(messages[n - 1].content, "- User interrupt");
        assert_eq!(turn.steps[0].interrupts, vec!["User interrupt".to_string()]);
        assert!(bus.drain_events(&turn.session_key).is_empty());
    }

    #[tokio::test]
    async fn event_cancels_pending_tool_calls() {
        let (orch, provider, bus) = interrupting(
            vec![
                make_tool_call_response(
                    vec![
                        make_tool_call("c1", "web_search", json!({"query": "test"})),
                        make_tool_call("c2", "read_file", json!({"path": "a"})),
                    ],
                    "Let me search",
                ),
                make_text_response("Stopping as asked."),
            ],
            "Stop now",
        );
        let search = Arc::new(CountingTool::new("web_search"));
        let read = Arc::new(CountingTool::new("read_file"));
        let tools = ToolRegistry::new().with(search.clone()).with(read.clone());

        let turn = orch
            .run_turn(&session(), TurnInput::user("test"), &tools, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search.calls(), 0);
        assert_eq!(read.calls(), 0);
        assert!(turn.invocations().all(|i| i.output == INTERRUPTED_OUTPUT));
        assert!(turn.invocations().all(|i| i.error_code.as_deref() == Some("interrupted")));
        assert_eq!(turn.reply(), Some("Stopping as asked."));
        assert_eq!(turn.steps[1].interrupts, vec!["Stop now".to_string()]);

        let second = &provider.inner.requests()[1].messages;
        let cancelled = second
            .iter()
            .filter(|m| m.role == snapclaw_core::message::Role::Tool && m.content == INTERRUPTED_OUTPUT)
            .count();
        assert_eq!(cancelled, 2);
        assert_eq!(second.last().unwrap().content, "- Stop now");
        assert!(bus.drain_events(&turn.session_key).is_empty());
    }

    #[tokio::test]
    async fn undelivered_events_are_requeued() {
        let (orch, _provider, bus) = interrupting(vec![make_text_response("Done.")], "one more thing");
        let turn = orch
            .run_turn(&session(), TurnInput::user("test"), &ToolRegistry::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.reply(), Some("Done."));
        assert_eq!(bus.drain_events(&turn.session_key), vec!["one more thing".to_string()]);
    }
}
