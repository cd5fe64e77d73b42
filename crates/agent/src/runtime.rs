//! Session dispatch.
//!
//! [`AgentRuntime`] consumes inbound events from the [`MessageBus`], runs at
//! most one turn per session at a time (different sessions run in parallel),
//! handles slash commands and sends replies and progress back out.
//!
//! `/stop` and the `/doctor` family are handled as soon as they arrive, so
//! they can cancel the turn that currently holds the session.
//!
//! With event handling on, a message for a session that already has a turn in
//! flight is queued as an event for that turn instead of starting a new one.
//! Events the turn never delivered are replayed as a follow-up turn.

use crate::orchestrator::{ConversationOrchestrator, TurnInput};
use crate::prompt_guard::wrap_untrusted;
use crate::stream_event::{ProgressSink, TurnEvent};
use crate::subagent::{SpawnTool, SubagentManager};
use snapclaw_core::bus::{format_events, InboundEvent, InboundMessage, MessageBus, OutboundMessage, SubagentReport};
use snapclaw_core::error::Result;
use snapclaw_core::memory::{HistoryEntry, MemoryStore};
use snapclaw_core::redact;
use snapclaw_core::session::{SessionKey, SessionMode, SessionStore};
use snapclaw_core::tool::ToolRegistry;
use snapclaw_core::turn::{Turn, TurnOrigin};
use snapclaw_memory::SessionLocks;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const HELP_TEXT: &str = "🐈 SnapClaw commands:\n\
/stop — Stop the current task\n\
/plan — Plan before acting\n\
/normal — Back to normal mode\n\
/doctor — Start a diagnosis session\n\
/doctor status — Show diagnosis status\n\
/doctor cancel — Leave doctor mode\n\
/help — Show available commands";

const ERROR_REPLY: &str = "Sorry, I encountered an error.";
const BACKGROUND_DONE: &str = "Background task completed.";

/// A recognized slash command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Help,
    Plan,
    Normal,
    Doctor,
    DoctorCancel,
    DoctorStatus,
}

impl Command {
    /// Exact, case-insensitive match. Anything else is a normal message.
    pub fn parse(content: &str) -> Option<Self> {
        let lowered = content.trim().to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();
        match words.as_slice() {
            ["/stop"] => Some(Self::Stop),
            ["/help"] => Some(Self::Help),
            ["/plan"] => Some(Self::Plan),
            ["/normal"] => Some(Self::Normal),
            ["/doctor"] => Some(Self::Doctor),
            ["/doctor", "cancel"] => Some(Self::DoctorCancel),
            ["/doctor", "status"] => Some(Self::DoctorStatus),
            _ => None,
        }
    }

    /// Handled on arrival instead of queueing behind the session's turn.
    pub fn is_immediate(self) -> bool {
        matches!(self, Self::Stop | Self::Doctor | Self::DoctorCancel | Self::DoctorStatus)
    }
}

/// Text of the system turn that hands a subagent result back to its parent.
/// With `tagged` the result is fenced as untrusted content.
pub fn subagent_announcement(report: &SubagentReport, tagged: bool) -> String {
    let result = if tagged {
        wrap_untrusted(&report.result, &format!("subagent:{}", report.label))
    } else {
        report.result.clone()
    };
    format!(
        "[Subagent '{}' {}]\n\nTask: {}\n\nResult:\n{}\n\n\
         Summarize this naturally for the user. Keep it brief (1-2 sentences). \
         Do not mention technical details like \"subagent\" or task IDs.",
        report.label, report.outcome, report.task, result
    )
}

/// `(channel, chat_id)` for a session key of the form `channel:chat_id`.
fn route_for(key: &SessionKey) -> (String, String) {
    match key.as_str().split_once(':') {
        Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
        None => ("cli".to_string(), key.as_str().to_string()),
    }
}

/// A queued or running turn that `/stop` can reach.
#[derive(Clone)]
struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

struct RuntimeInner {
    orchestrator: ConversationOrchestrator,
    memory: Arc<dyn MemoryStore>,
    subagents: SubagentManager,
    tools: ToolRegistry,
    bus: MessageBus,
    locks: SessionLocks,
    active: Mutex<HashMap<SessionKey, Vec<ActiveTurn>>>,
    next_turn: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    /// `tools` is the base tool set; every turn also gets a `spawn` tool
    /// bound to it. Mid-turn events are wired through `bus` when the
    /// orchestrator's config enables them.
    pub fn new(
        orchestrator: ConversationOrchestrator,
        memory: Arc<dyn MemoryStore>,
        subagents: SubagentManager,
        tools: ToolRegistry,
        bus: MessageBus,
    ) -> Self {
        let orchestrator = if orchestrator.config().enable_event_handling && !orchestrator.interrupts_enabled() {
            orchestrator.with_interrupts(bus.clone())
        } else {
            orchestrator
        };
        Self {
            inner: Arc::new(RuntimeInner {
                orchestrator,
                memory,
                subagents,
                tools,
                bus,
                locks: SessionLocks::new(),
                active: Mutex::new(HashMap::new()),
                next_turn: AtomicU64::new(0),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &ConversationOrchestrator {
        &self.inner.orchestrator
    }

    pub fn subagents(&self) -> &SubagentManager {
        &self.inner.subagents
    }

    fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.inner.orchestrator.sessions()
    }

    /// Consume inbound events until the queue closes.
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundEvent>) {
        info!("Agent runtime started");
        while let Some(event) = inbound.recv().await {
            let key = event.session_key();
            if let InboundEvent::UserMessage(msg) = &event {
                if let Some(command) = Command::parse(&msg.content).filter(|c| c.is_immediate()) {
                    let reply = match self.run_command(command, &key).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!(session = %key, error = %e, "Command failed");
                            ERROR_REPLY.to_string()
                        }
                    };
                    self.publish(OutboundMessage::reply(&msg.channel, &msg.chat_id, reply)).await;
                    continue;
                }
                if Command::parse(&msg.content).is_none() && self.try_interrupt(&key, &msg.content).await {
                    info!(session = %key, "Queued message as an event for the running turn");
                    continue;
                }
            }

            let turn = self.register(&key).await;
            let runtime = self.clone();
            tokio::spawn(async move {
                runtime.dispatch(event, turn).await;
            });
        }
        info!("Agent runtime stopped");
    }

    /// Process one message without the bus and return the reply. Used by the
    /// CLI; progress goes to `progress` when given.
    pub async fn process_direct(
        &self,
        channel: &str,
        chat_id: &str,
        content: &str,
        progress: Option<ProgressSink>,
    ) -> Result<String> {
        let msg = InboundMessage::new(channel, chat_id, content);
        let key = msg.session_key();
        if let Some(command) = Command::parse(content).filter(|c| c.is_immediate()) {
            return self.run_command(command, &key).await;
        }

        let turn = self.register(&key).await;
        let result = self.handle(InboundEvent::UserMessage(msg), &turn.cancel, progress).await;
        self.unregister(&key, &turn).await;
        Ok(result?.unwrap_or_default())
    }

    /// Wait for background history appends started so far.
    pub async fn flush_background(&self) {
        let handles = std::mem::take(&mut *self.inner.background.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task panicked");
            }
        }
    }

    /// Turns queued or running for `key`.
    pub async fn active_count(&self, key: &SessionKey) -> usize {
        self.inner
            .active
            .lock()
            .await
            .get(key)
            .map_or(0, |turns| turns.iter().filter(|t| !t.cancel.is_cancelled()).count())
    }

    async fn register(&self, key: &SessionKey) -> ActiveTurn {
        let active = ActiveTurn {
            id: self.inner.next_turn.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        self.inner
            .active
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .push(active.clone());
        active
    }

    /// Queue `content` as an event when `key` has a turn in flight. Checked
    /// under the same lock that [`Self::finish`] drains under, so an event is
    /// either seen by the turn or replayed after it.
    async fn try_interrupt(&self, key: &SessionKey, content: &str) -> bool {
        if !self.inner.orchestrator.interrupts_enabled() {
            return false;
        }
        let active = self.inner.active.lock().await;
        let busy = active
            .get(key)
            .is_some_and(|turns| turns.iter().any(|t| !t.cancel.is_cancelled()));
        if busy {
            self.inner.bus.publish_event(key, content);
        }
        busy
    }

    /// Unregister `turn`. When it was the session's last turn and events are
    /// still queued, register a follow-up turn for them and return it with the
    /// message it should process.
    async fn finish(&self, key: &SessionKey, turn: &ActiveTurn) -> Option<(String, ActiveTurn)> {
        let mut active = self.inner.active.lock().await;
        if let Some(turns) = active.get_mut(key) {
            turns.retain(|t| t.id != turn.id);
            if turns.is_empty() {
                active.remove(key);
            }
        }
        if !self.inner.orchestrator.interrupts_enabled() || active.contains_key(key) {
            return None;
        }
        let leftover = self.inner.bus.drain_events(key);
        let content = format_events(&leftover)?;
        info!(session = %key, events = leftover.len(), "Replaying undelivered events as a follow-up turn");
        let follow_up = ActiveTurn {
            id: self.inner.next_turn.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        active.entry(key.clone()).or_default().push(follow_up.clone());
        Some((content, follow_up))
    }

    async fn unregister(&self, key: &SessionKey, turn: &ActiveTurn) {
        let mut active = self.inner.active.lock().await;
        if let Some(turns) = active.get_mut(key) {
            turns.retain(|t| t.id != turn.id);
            if turns.is_empty() {
                active.remove(key);
            }
        }
    }

    /// Cancel every queued or running turn of `key`. Returns how many.
    async fn cancel_turns(&self, key: &SessionKey) -> usize {
        let turns = self.inner.active.lock().await.remove(key).unwrap_or_default();
        let mut count = 0;
        for turn in turns {
            if !turn.cancel.is_cancelled() {
                turn.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    async fn publish(&self, message: OutboundMessage) {
        if let Err(e) = self.inner.bus.publish_outbound(message).await {
            warn!(error = %e, "Failed to publish outbound message");
        }
    }

    async fn dispatch(&self, event: InboundEvent, turn: ActiveTurn) {
        let key = event.session_key();
        let (channel, chat_id) = match &event {
            InboundEvent::UserMessage(msg) => (msg.channel.clone(), msg.chat_id.clone()),
            InboundEvent::SubagentResult(report) => route_for(&report.parent_session),
        };

        let mut next = Some((event, turn));
        while let Some((event, turn)) = next.take() {
            let (progress, forwarder) = self.progress_forwarder(&channel, &chat_id);
            let result = self.handle(event, &turn.cancel, Some(progress)).await;
            let follow_up = self.finish(&key, &turn).await;
            if let Err(e) = forwarder.await {
                warn!(error = %e, "Progress forwarder panicked");
            }

            match result {
                Ok(Some(reply)) => self.publish(OutboundMessage::reply(&channel, &chat_id, reply)).await,
                Ok(None) => debug!(session = %key, "No reply to deliver"),
                Err(e) => {
                    error!(session = %key, error = %e, "Error processing message");
                    self.publish(OutboundMessage::reply(&channel, &chat_id, ERROR_REPLY)).await;
                }
            }

            next = follow_up.map(|(content, turn)| {
                let msg = InboundMessage::new(&channel, &chat_id, content);
                (InboundEvent::UserMessage(msg), turn)
            });
        }
    }

    /// Forward progress events to the bus until every sender is dropped.
    fn progress_forwarder(&self, channel: &str, chat_id: &str) -> (ProgressSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TurnEvent>();
        let bus = self.inner.bus.clone();
        let channel = channel.to_string();
        let chat_id = chat_id.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(text) = event.progress_text() else {
                    continue;
                };
                if bus
                    .publish_outbound(OutboundMessage::progress(&channel, &chat_id, text))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        (tx, handle)
    }

    /// Run a queued event under the session lock. Returns the reply, if any.
    async fn handle(
        &self,
        event: InboundEvent,
        token: &CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Result<Option<String>> {
        let key = event.session_key();
        let _guard = self.inner.locks.lock(&key).await;

        let input = match event {
            InboundEvent::UserMessage(msg) => {
                if let Some(command) = Command::parse(&msg.content) {
                    return self.run_command(command, &key).await.map(Some);
                }
                info!(session = %key, preview = %redact::preview(&msg.content, 80), "Processing message");
                TurnInput::user(msg.content)
            }
            InboundEvent::SubagentResult(report) => {
                info!(session = %key, task_id = %report.task_id, "Processing subagent result");
                let tagged = self.inner.orchestrator.builder().content_tagging();
                TurnInput::system("subagent", subagent_announcement(&report, tagged))
            }
        };
        let from_subagent = matches!(input.origin, TurnOrigin::System { .. });
        let input = match progress {
            Some(progress) => input.with_progress(progress),
            None => input,
        };

        let spawn = SpawnTool::new(
            self.inner.subagents.clone(),
            key.clone(),
            input.turn_id.clone(),
            self.inner.tools.clone(),
        );
        let tools = self.inner.tools.clone().with(Arc::new(spawn));

        let session = self.sessions().get_or_create(&key).await?;
        let turn = self.inner.orchestrator.run_turn(&session, input, &tools, token).await?;
        self.consolidate(&key, &turn).await;

        let reply = turn.reply().map(str::to_string);
        Ok(match reply {
            Some(reply) => Some(reply),
            None if from_subagent && !token.is_cancelled() => Some(BACKGROUND_DONE.to_string()),
            None => None,
        })
    }

    /// Record the turn in history without holding up the reply.
    async fn consolidate(&self, key: &SessionKey, turn: &Turn) {
        let memory = self.inner.memory.clone();
        let key = key.clone();
        let entry = HistoryEntry::from_turn(turn);
        let handle = tokio::spawn(async move {
            if let Err(e) = memory.append_history(&key, entry).await {
                warn!(session = %key, error = %e, "Failed to append history entry");
            }
        });
        let mut background = self.inner.background.lock().await;
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    async fn run_command(&self, command: Command, key: &SessionKey) -> Result<String> {
        match command {
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Plan => {
                self.sessions().set_mode(key, SessionMode::Plan).await?;
                Ok("📋 Plan mode on. I'll outline a plan before acting. Use /normal to switch back.".to_string())
            }
            Command::Normal => {
                self.sessions().set_mode(key, SessionMode::Normal).await?;
                Ok("Back to normal mode.".to_string())
            }
            Command::Stop => {
                let turns = self.cancel_turns(key).await;
                let dropped = self.inner.bus.drain_events(key).len();
                if dropped > 0 {
                    debug!(session = %key, dropped, "Dropped queued events");
                }
                let subagents = self.inner.subagents.cancel_by_session(key).await;
                let total = turns + subagents;
                info!(session = %key, turns, subagents, "Stop requested");
                Ok(if total > 0 {
                    format!("⏹ Stopped {total} task(s).")
                } else {
                    "No active task to stop.".to_string()
                })
            }
            Command::Doctor => {
                let stopped = self.cancel_turns(key).await + self.inner.subagents.cancel_by_session(key).await;
                self.sessions().set_mode(key, SessionMode::Doctor).await?;
                info!(session = %key, stopped, "Doctor mode enabled");
                Ok("🩺 Doctor mode enabled. Describe the problem and I'll look for the root cause. \
                    Use /doctor status to check progress or /doctor cancel to leave."
                    .to_string())
            }
            Command::DoctorCancel => {
                let stopped = self.cancel_turns(key).await;
                self.sessions().set_mode(key, SessionMode::Normal).await?;
                info!(session = %key, stopped, "Doctor mode cancelled");
                Ok("Doctor mode cancelled. Back to normal mode.".to_string())
            }
            Command::DoctorStatus => {
                let session = self.sessions().get_or_create(key).await?;
                let running = self.active_count(key).await;
                let activity = if running == 0 {
                    "idle".to_string()
                } else {
                    format!("running ({running} active task(s))")
                };
                Ok(format!("Doctor status: {activity}. Mode: {}.", session.mode))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBuilder, ContextCompressor};
    use crate::test_helpers::*;
    use async_trait::async_trait;
    use serde_json::json;
    use snapclaw_core::agent::{AgentConfig, CompressionConfig};
    use snapclaw_core::bus::BusReceivers;
    use snapclaw_core::error::ToolError;
    use snapclaw_core::identity::Identity;
    use snapclaw_core::message::Role;
    use snapclaw_core::provider::Provider;
    use snapclaw_core::tool::{Tool, ToolResult};
    use snapclaw_core::turn::{TurnId, TurnOutcome};
    use snapclaw_memory::{InMemorySessionStore, InMemoryStore};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        runtime: AgentRuntime,
        bus: MessageBus,
        rx: BusReceivers,
        sessions: Arc<InMemorySessionStore>,
        memory: Arc<InMemoryStore>,
    }

    fn harness(provider: Arc<SequentialMockProvider>, tools: ToolRegistry) -> Harness {
        harness_with(provider, tools, MessageBus::new(32), AgentConfig::default())
    }

    fn harness_with(
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        (bus, rx): (MessageBus, BusReceivers),
        config: AgentConfig,
    ) -> Harness {
        let memory = Arc::new(InMemoryStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let compressor = ContextCompressor::new(CompressionConfig::default(), memory.clone());
        let builder = ContextBuilder::new(Identity::default(), Arc::new(compressor))
            .with_event_handling(config.enable_event_handling);
        let orchestrator =
            ConversationOrchestrator::new(provider.clone(), sessions.clone(), Arc::new(builder)).with_config(config);
        let subagents = SubagentManager::new(provider, memory.clone(), bus.clone());
        let runtime = AgentRuntime::new(orchestrator, memory.clone(), subagents, tools, bus.clone());
        Harness {
            runtime,
            bus,
            rx,
            sessions,
            memory,
        }
    }

    async fn next_reply(rx: &mut BusReceivers) -> OutboundMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.outbound.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("outbound queue closed");
            if !msg.progress {
                return msg;
            }
        }
    }

    /// Signals when it starts and waits to be released.
    struct GateTool {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Tool for GateTool {
        fn name(&self) -> &str {
            "gate"
        }

        fn description(&self) -> &str {
            "Waits for the test"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ToolResult::ok("gate opened"))
        }
    }

    #[test]
    fn parses_commands_exactly() {
        assert_eq!(Command::parse(" /STOP "), Some(Command::Stop));
        assert_eq!(Command::parse("/doctor   status"), Some(Command::DoctorStatus));
        assert_eq!(Command::parse("/doctor cancel"), Some(Command::DoctorCancel));
        assert_eq!(Command::parse("/doctorr"), None);
        assert_eq!(Command::parse("/doctor my build fails"), None);
        assert_eq!(Command::parse("please /stop"), None);
        assert!(Command::Stop.is_immediate());
        assert!(!Command::Plan.is_immediate());
    }

    #[test]
    fn help_lists_doctor_commands() {
        assert!(HELP_TEXT.contains("/doctor status"));
        assert!(HELP_TEXT.contains("/doctor cancel"));
        assert!(HELP_TEXT.contains("/stop"));
    }

    #[tokio::test]
    async fn direct_message_replies_and_records_history() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello there"));
        let h = harness(provider.clone(), ToolRegistry::new());

        let reply = h.runtime.process_direct("cli", "direct", "hi", None).await.unwrap();
        assert_eq!(reply, "Hello there");

        h.runtime.flush_background().await;
        let key = SessionKey::new("cli", "direct");
        let history = h.memory.load_recent_history(&key, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(h.runtime.active_count(&key).await, 0);

        // Every turn is offered the spawn tool.
        let requests = provider.requests();
        assert!(requests[0].tools.iter().any(|t| t.name == "spawn"));
    }

    #[tokio::test]
    async fn plan_and_normal_switch_modes() {
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let h = harness(provider.clone(), ToolRegistry::new());
        let key = SessionKey::new("cli", "direct");

        let reply = h.runtime.process_direct("cli", "direct", "/plan", None).await.unwrap();
        assert!(reply.contains("Plan mode"));
        assert_eq!(h.sessions.get_or_create(&key).await.unwrap().mode, SessionMode::Plan);

        h.runtime.process_direct("cli", "direct", "do it", None).await.unwrap();
        assert!(provider.requests()[0].messages[0].content.contains("**Plan:**"));

        h.runtime.process_direct("cli", "direct", "/normal", None).await.unwrap();
        assert_eq!(h.sessions.get_or_create(&key).await.unwrap().mode, SessionMode::Normal);
        // Commands never reach the model.
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn doctor_lifecycle() {
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let h = harness(provider, ToolRegistry::new());
        let key = SessionKey::new("cli", "direct");

        let status = h.runtime.process_direct("cli", "direct", "/doctor status", None).await.unwrap();
        assert!(status.contains("idle"));

        let started = h.runtime.process_direct("cli", "direct", "/doctor", None).await.unwrap();
        assert!(started.to_lowercase().contains("doctor mode"));
        assert_eq!(h.sessions.get_or_create(&key).await.unwrap().mode, SessionMode::Doctor);

        let cancelled = h.runtime.process_direct("cli", "direct", "/doctor cancel", None).await.unwrap();
        assert!(cancelled.to_lowercase().contains("cancel"));
        assert_eq!(h.sessions.get_or_create(&key).await.unwrap().mode, SessionMode::Normal);
    }

    #[tokio::test]
    async fn stop_without_work() {
        let h = harness(Arc::new(SequentialMockProvider::single_text("ok")), ToolRegistry::new());
        let reply = h.runtime.process_direct("cli", "direct", "/stop", None).await.unwrap();
        assert_eq!(reply, "No active task to stop.");
    }

    #[tokio::test]
    async fn stop_cancels_running_turn_and_keeps_completed_tool_result() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "gate", json!({}))], ""),
            make_text_response("should never be requested"),
        ]));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let tools = ToolRegistry::new().with(Arc::new(GateTool {
            started: started.clone(),
            release: release.clone(),
        }));
        let Harness {
            runtime,
            bus,
            rx,
            sessions,
            ..
        } = harness(provider.clone(), tools);

        let BusReceivers { inbound, outbound } = rx;
        let loop_runtime = runtime.clone();
        tokio::spawn(async move { loop_runtime.run(inbound).await });
        let mut rx = BusReceivers {
            inbound: mpsc::channel(1).1,
            outbound,
        };

        bus.publish_inbound(InboundEvent::UserMessage(InboundMessage::new("cli", "c1", "wait")))
            .await
            .unwrap();
        started.notified().await;

        bus.publish_inbound(InboundEvent::UserMessage(InboundMessage::new("cli", "c1", "/stop")))
            .await
            .unwrap();
        let stopped = next_reply(&mut rx).await;
        assert_eq!(stopped.content, "⏹ Stopped 1 task(s).");
        release.notify_one();

        let key = SessionKey::new("cli", "c1");
        let turn = loop {
            let session = sessions.get_or_create(&key).await.unwrap();
            if let Some(turn) = session.turns.last() {
                break turn.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(turn.outcome, Some(TurnOutcome::Cancelled));
        let kept: Vec<_> = turn.invocations().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].output, "gate opened");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn subagent_result_becomes_system_turn() {
        let provider = Arc::new(SequentialMockProvider::single_text("Your research is done."));
        let Harness {
            runtime,
            bus,
            rx,
            sessions,
            ..
        } = harness(provider.clone(), ToolRegistry::new());
        let BusReceivers { inbound, outbound } = rx;
        let mut outbound = BusReceivers {
            inbound: mpsc::channel(1).1,
            outbound,
        };
        let loop_runtime = runtime.clone();
        tokio::spawn(async move { loop_runtime.run(inbound).await });

        let parent = SessionKey::new("telegram", "7");
        bus.publish_inbound(InboundEvent::SubagentResult(SubagentReport {
            task_id: "ab12cd34".into(),
            label: "research".into(),
            task: "find the release date".into(),
            parent_session: parent.clone(),
            parent_turn: TurnId::new(),
            outcome: "completed".into(),
            result: "March 3rd".into(),
        }))
        .await
        .unwrap();

        let reply = next_reply(&mut outbound).await;
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "7");
        assert_eq!(reply.content, "Your research is done.");

        let requests = provider.requests();
        let last = requests[0].messages.last().unwrap();
        assert!(last.content.contains("[Subagent 'research' completed]"));
        assert!(last.content.contains("March 3rd"));

        let session = sessions.get_or_create(&parent).await.unwrap();
        assert!(matches!(session.turns[0].origin, TurnOrigin::System { .. }));
    }

    fn with_events() -> AgentConfig {
        AgentConfig {
            enable_event_handling: true,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn message_during_a_turn_is_delivered_to_it() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "gate", json!({}))], ""),
            make_text_response("Checked both."),
        ]));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let tools = ToolRegistry::new().with(Arc::new(GateTool {
            started: started.clone(),
            release: release.clone(),
        }));
        let Harness { runtime, bus, rx, sessions, .. } =
            harness_with(provider.clone(), tools, MessageBus::new(32), with_events());
        assert!(runtime.orchestrator().interrupts_enabled());

        let BusReceivers { inbound, outbound } = rx;
        let loop_runtime = runtime.clone();
        tokio::spawn(async move { loop_runtime.run(inbound).await });
        let mut rx = BusReceivers {
            inbound: mpsc::channel(1).1,
            outbound,
        };

        bus.publish_inbound(InboundEvent::UserMessage(InboundMessage::new("cli", "c1", "check the build")))
            .await
            .unwrap();
        started.notified().await;
        bus.publish_inbound(InboundEvent::UserMessage(InboundMessage::new("cli", "c1", "and the logs")))
            .await
            .unwrap();

        let key = SessionKey::new("cli", "c1");
        while bus.queued_events(&key) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        release.notify_one();

        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.content, "Checked both.");
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "- and the logs");
        assert!(requests[1].messages[0].content.contains("## Event Handling"));

        let session = sessions.get_or_create(&key).await.unwrap();
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].steps[1].interrupts, vec!["and the logs".to_string()]);
    }

    #[tokio::test]
    async fn undelivered_events_replay_as_a_follow_up_turn() {
        let (bus, receivers) = MessageBus::new(32);
        let key = SessionKey::new("cli", "c1");
        let provider = Arc::new(InterruptingProvider::new(
            vec![make_text_response("ok")],
            bus.clone(),
            key.clone(),
            "interrupt A",
        ));
        let Harness { runtime, rx, sessions, .. } =
            harness_with(provider.clone(), ToolRegistry::new(), (bus.clone(), receivers), with_events());
        bus.publish_event(&SessionKey::new("cli", "other"), "elsewhere");

        let BusReceivers { inbound, outbound } = rx;
        let loop_runtime = runtime.clone();
        tokio::spawn(async move { loop_runtime.run(inbound).await });
        let mut rx = BusReceivers {
            inbound: mpsc::channel(1).1,
            outbound,
        };

        bus.publish_inbound(InboundEvent::UserMessage(InboundMessage::new("cli", "c1", "original task")))
            .await
            .unwrap();
        next_reply(&mut rx).await;
        next_reply(&mut rx).await;

        let session = sessions.get_or_create(&key).await.unwrap();
        let processed: Vec<&str> = session.turns.iter().map(|t| t.user_message.as_str()).collect();
        assert_eq!(processed, vec!["original task", "- interrupt A"]);
        assert_eq!(provider.inner.call_count(), 2);
        assert_eq!(bus.queued_events(&key), 0);
        assert_eq!(bus.queued_events(&SessionKey::new("cli", "other")), 1);
    }

    #[tokio::test]
    async fn without_event_handling_messages_queue_as_turns() {
        let h = harness(Arc::new(SequentialMockProvider::single_text("ok")), ToolRegistry::new());
        assert!(!h.runtime.orchestrator().interrupts_enabled());
        let key = SessionKey::new("cli", "c1");
        let turn = h.runtime.register(&key).await;
        assert!(!h.runtime.try_interrupt(&key, "hello").await);
        assert_eq!(h.bus.queued_events(&key), 0);
        assert!(h.runtime.finish(&key, &turn).await.is_none());
    }

    #[tokio::test]
    async fn stop_drops_queued_events() {
        let h = harness_with(
            Arc::new(SequentialMockProvider::single_text("ok")),
            ToolRegistry::new(),
            MessageBus::new(32),
            with_events(),
        );
        let key = SessionKey::new("cli", "c1");
        let turn = h.runtime.register(&key).await;
        assert!(h.runtime.try_interrupt(&key, "never mind").await);
        assert_eq!(h.bus.queued_events(&key), 1);

        let reply = h.runtime.process_direct("cli", "c1", "/stop", None).await.unwrap();
        assert_eq!(reply, "⏹ Stopped 1 task(s).");
        assert_eq!(h.bus.queued_events(&key), 0);
        assert!(h.runtime.finish(&key, &turn).await.is_none());
    }

    #[test]
    fn announcement_and_routing() {
        let report = SubagentReport {
            task_id: "t".into(),
            label: "lookup".into(),
            task: "look".into(),
            parent_session: SessionKey::from("slack:C1"),
            parent_turn: TurnId::new(),
            outcome: "failed".into(),
            result: "Error: timeout".into(),
        };
        assert!(subagent_announcement(&report, false).starts_with("[Subagent 'lookup' failed]"));
        assert!(subagent_announcement(&report, false).contains("Result:\nError: timeout"));
        let tagged = subagent_announcement(&report, true);
        assert!(tagged.starts_with("[Subagent 'lookup' failed]"));
        assert!(tagged.contains("[-- BEGIN UNTRUSTED CONTENT: subagent:lookup --]\nError: timeout"));
        assert_eq!(route_for(&report.parent_session), ("slack".to_string(), "C1".to_string()));
        assert_eq!(route_for(&SessionKey::from("direct")), ("cli".to_string(), "direct".to_string()));
    }
}
