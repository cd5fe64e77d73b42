//! Background sub-tasks.
//!
//! A subagent runs one delegated task with its own orchestrator, its own
//! turn-scoped cache and loop guard, a smaller iteration budget and a
//! restricted tool set (never `spawn`). It sees the parent's facts as they
//! were when it started; anything it would write to memory is held back and
//! applied to the parent's store once it finishes. The result comes back to
//! the parent session as an [`InboundEvent::SubagentResult`].

use crate::context::{ContextBuilder, ContextCompressor};
use crate::orchestrator::{ConversationOrchestrator, TurnInput};
use async_trait::async_trait;
use chrono::Utc;
use snapclaw_core::agent::{AgentConfig, CompressionConfig, SubagentConfig};
use snapclaw_core::bus::{InboundEvent, MessageBus, SubagentReport};
use snapclaw_core::error::{MemoryError, ToolError};
use snapclaw_core::event::{DomainEvent, EventBus};
use snapclaw_core::identity::Identity;
use snapclaw_core::memory::{snippet, FactsSnapshot, HistoryEntry, MemoryFact, MemoryStore, MergeReport};
use snapclaw_core::provider::{Provider, SamplingConfig};
use snapclaw_core::session::{Session, SessionKey};
use snapclaw_core::tool::{Tool, ToolRegistry, ToolResult};
use snapclaw_core::turn::{TurnId, TurnOutcome};
use snapclaw_memory::InMemorySessionStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SPAWN_TOOL_NAME: &str = "spawn";

const LABEL_CHARS: usize = 30;

/// Memory view for a subagent: the parent's facts frozen at start, with all
/// writes deferred.
pub struct SnapshotMemory {
    facts: RwLock<FactsSnapshot>,
    deferred_facts: Mutex<Vec<MemoryFact>>,
    deferred_history: Mutex<Vec<HistoryEntry>>,
}

impl SnapshotMemory {
    pub fn new(snapshot: FactsSnapshot) -> Self {
        Self {
            facts: RwLock::new(snapshot),
            deferred_facts: Mutex::new(Vec::new()),
            deferred_history: Mutex::new(Vec::new()),
        }
    }

    /// Apply deferred writes to `target` under `session`.
    pub async fn flush(&self, target: &dyn MemoryStore, session: &SessionKey) -> Result<(), MemoryError> {
        let facts = std::mem::take(&mut *self.deferred_facts.lock().await);
        if !facts.is_empty() {
            target.upsert_facts(session, facts).await?;
        }
        let history = std::mem::take(&mut *self.deferred_history.lock().await);
        for mut entry in history {
            entry.session_key = session.clone();
            target.append_history(session, entry).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for SnapshotMemory {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn upsert_facts(&self, _session: &SessionKey, facts: Vec<MemoryFact>) -> Result<MergeReport, MemoryError> {
        let report = self
            .facts
            .write()
            .await
            .merge(&facts, snapclaw_core::memory::DEFAULT_FACTS_CAPACITY);
        self.deferred_facts.lock().await.extend(facts);
        Ok(report)
    }

    async fn append_history(&self, _session: &SessionKey, entry: HistoryEntry) -> Result<(), MemoryError> {
        self.deferred_history.lock().await.push(entry);
        Ok(())
    }

    async fn load_facts_snapshot(&self, _session: &SessionKey) -> Result<FactsSnapshot, MemoryError> {
        Ok(self.facts.read().await.clone())
    }

    async fn load_recent_history(&self, _session: &SessionKey, limit: usize) -> Result<Vec<HistoryEntry>, MemoryError> {
        let history = self.deferred_history.lock().await;
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].to_vec())
    }
}

struct RunningTask {
    session: SessionKey,
    label: String,
    cancel: CancellationToken,
}

/// A spawned sub-task.
pub struct SubagentHandle {
    pub task_id: String,
    pub label: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SubagentHandle {
    /// Request cancellation. The sub-task still reports back, as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the sub-task to finish and report.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(task_id = %self.task_id, error = %e, "Subagent task panicked");
        }
    }
}

/// Spawns and tracks sub-tasks. Cheap to clone.
#[derive(Clone)]
pub struct SubagentManager {
    provider: Arc<dyn Provider>,
    memory: Arc<dyn MemoryStore>,
    identity: Identity,
    agent: AgentConfig,
    compression: CompressionConfig,
    sampling: SamplingConfig,
    config: SubagentConfig,
    bus: MessageBus,
    events: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<String, RunningTask>>>,
}

impl SubagentManager {
    pub fn new(provider: Arc<dyn Provider>, memory: Arc<dyn MemoryStore>, bus: MessageBus) -> Self {
        let config = SubagentConfig::default();
        Self {
            provider,
            memory,
            identity: Identity::default(),
            agent: AgentConfig::default(),
            compression: CompressionConfig::default(),
            sampling: SamplingConfig::default(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            bus,
            events: Arc::new(EventBus::default()),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: SubagentConfig) -> Self {
        self.semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        self.config = config;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_agent_config(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
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

    /// Sub-tasks spawned and not yet reported, including those waiting for
    /// a concurrency slot.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Cancel every sub-task spawned from `session`. Returns how many.
    pub async fn cancel_by_session(&self, session: &SessionKey) -> usize {
        let running = self.running.lock().await;
        let mut count = 0;
        for (task_id, task) in running.iter() {
            if &task.session == session && !task.cancel.is_cancelled() {
                debug!(task_id = %task_id, label = %task.label, "Cancelling subagent");
                task.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Start a sub-task in the background.
    pub async fn spawn(
        &self,
        parent_session: SessionKey,
        parent_turn: TurnId,
        label: Option<String>,
        task: String,
        tools: ToolRegistry,
    ) -> SubagentHandle {
        let task_id: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        let label = label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| snippet(&task, LABEL_CHARS));
        let tools = tools.without(&[SPAWN_TOOL_NAME]);
        let cancel = CancellationToken::new();

        self.running.lock().await.insert(
            task_id.clone(),
            RunningTask {
                session: parent_session.clone(),
                label: label.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(session = %parent_session, task_id = %task_id, label = %label, "Subagent spawned");
        self.events.publish(DomainEvent::SubagentSpawned {
            session: parent_session.to_string(),
            task_id: task_id.clone(),
            label: label.clone(),
            timestamp: Utc::now(),
        });

        let manager = self.clone();
        let job = SubTask {
            task_id: task_id.clone(),
            label: label.clone(),
            task,
            parent_session,
            parent_turn,
        };
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            manager.run(job, tools, token).await;
        });

        SubagentHandle {
            task_id,
            label,
            cancel,
            join,
        }
    }

    async fn run(&self, job: SubTask, tools: ToolRegistry, cancel: CancellationToken) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        };

        let (outcome, result) = match permit {
            Some(_permit) => self.execute(&job, tools, &cancel).await,
            None => ("cancelled".to_string(), "Subagent was cancelled before it started.".to_string()),
        };

        self.running.lock().await.remove(&job.task_id);
        info!(session = %job.parent_session, task_id = %job.task_id, outcome = %outcome, "Subagent finished");
        self.events.publish(DomainEvent::SubagentFinished {
            session: job.parent_session.to_string(),
            task_id: job.task_id.clone(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });

        let report = SubagentReport {
            task_id: job.task_id,
            label: job.label,
            task: job.task,
            parent_session: job.parent_session,
            parent_turn: job.parent_turn,
            outcome,
            result,
        };
        if let Err(e) = self.bus.publish_inbound(InboundEvent::SubagentResult(report)).await {
            warn!(error = %e, "Failed to deliver subagent result");
        }
    }

    /// Run the sub-task's single turn. Returns the outcome label and the text
    /// to report.
    async fn execute(&self, job: &SubTask, tools: ToolRegistry, cancel: &CancellationToken) -> (String, String) {
        let snapshot = match self.memory.load_facts_snapshot(&job.parent_session).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(task_id = %job.task_id, error = %e, "Failed to load parent facts, starting empty");
                FactsSnapshot::default()
            }
        };
        let memory = Arc::new(SnapshotMemory::new(snapshot));

        let compressor = ContextCompressor::new(self.compression.clone(), memory.clone());
        let identity = Identity::with_prompt(
            self.identity.name.clone(),
            format!(
                "{}\n\n## Subagent\n\nYou are a subagent working on one delegated task. \
                 Complete it with the tools you have and reply with a concise report of the result. \
                 You cannot spawn further subagents.",
                self.identity.system_prompt
            ),
        );
        let builder =
            ContextBuilder::new(identity, Arc::new(compressor)).with_content_tagging(self.agent.content_tagging);
        let orchestrator = ConversationOrchestrator::new(
            self.provider.clone(),
            Arc::new(InMemorySessionStore::default()),
            Arc::new(builder),
        )
        .with_config(AgentConfig {
            max_iterations: self.config.max_iterations,
            ..self.agent.clone()
        })
        .with_sampling(self.sampling.clone())
        .with_events(self.events.clone());

        let session = Session::new(SessionKey::new("subagent", &job.task_id));
        let input = TurnInput::user(job.task.clone()).with_parent(job.parent_turn.clone());
        let turn = match orchestrator.run_turn(&session, input, &tools, cancel).await {
            Ok(turn) => turn,
            Err(e) => return ("failed".into(), format!("Error: {e}")),
        };

        let mut entry = HistoryEntry::from_turn(&turn);
        entry.digest = format!("[subagent {}] {}", job.label, entry.digest);
        if let Err(e) = memory.append_history(&session.key, entry).await {
            warn!(task_id = %job.task_id, error = %e, "Failed to record subagent history");
        }
        if let Err(e) = memory.flush(self.memory.as_ref(), &job.parent_session).await {
            warn!(task_id = %job.task_id, error = %e, "Failed to apply subagent memory writes");
        }

        let result = match turn.outcome.as_ref() {
            Some(TurnOutcome::Completed { reply }) | Some(TurnOutcome::BudgetExhausted { reply }) => reply.clone(),
            Some(TurnOutcome::Cancelled) => "Subagent was cancelled.".to_string(),
            Some(TurnOutcome::Failed { error, partial_reply, .. }) => match partial_reply {
                Some(partial) => format!("Error: {error}\nPartial result: {partial}"),
                None => format!("Error: {error}"),
            },
            None => String::new(),
        };
        let label = turn.outcome.as_ref().map_or("failed", |o| o.label());
        (label.to_string(), result)
    }
}

struct SubTask {
    task_id: String,
    label: String,
    task: String,
    parent_session: SessionKey,
    parent_turn: TurnId,
}

/// The `spawn` tool, bound to one parent turn.
pub struct SpawnTool {
    manager: SubagentManager,
    session: SessionKey,
    turn: TurnId,
    tools: ToolRegistry,
}

impl SpawnTool {
    /// `tools` is what the sub-task may use; `spawn` is removed from it.
    pub fn new(manager: SubagentManager, session: SessionKey, turn: TurnId, tools: ToolRegistry) -> Self {
        Self {
            manager,
            session,
            turn,
            tools,
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        SPAWN_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use this for complex or \
         time-consuming work that can run independently. The subagent reports back when done."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task for the subagent to complete"},
                "label": {"type": "string", "description": "Optional short label for the task"}
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let task = arguments
            .get("task")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'task'".into()))?;
        let label = arguments.get("label").and_then(|l| l.as_str()).map(str::to_string);

        let handle = self
            .manager
            .spawn(self.session.clone(), self.turn.clone(), label, task.to_string(), self.tools.clone())
            .await;
        Ok(ToolResult::ok(format!(
            "Subagent [{}] started (id: {}). I'll notify you when it completes.",
            handle.label, handle.task_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use snapclaw_memory::InMemoryStore;
    use std::time::Duration;

    fn parent() -> SessionKey {
        SessionKey::new("telegram", "7")
    }

    #[tokio::test]
    async fn result_arrives_as_inbound_event() {
        let (bus, mut rx) = MessageBus::new(8);
        let memory = Arc::new(InMemoryStore::new());
        let provider = Arc::new(SequentialMockProvider::single_text("Task done: 42"));
        let manager = SubagentManager::new(provider, memory.clone(), bus);

        let turn = TurnId::new();
        let handle = manager
            .spawn(parent(), turn.clone(), Some("math".into()), "compute".into(), ToolRegistry::new())
            .await;
        handle.join().await;

        let InboundEvent::SubagentResult(report) = rx.inbound.recv().await.unwrap() else {
            panic!("expected a subagent result");
        };
        assert_eq!(report.parent_session, parent());
        assert_eq!(report.parent_turn, turn);
        assert_eq!(report.label, "math");
        assert_eq!(report.outcome, "completed");
        assert_eq!(report.result, "Task done: 42");
        assert_eq!(manager.running_count().await, 0);

        // The deferred history entry lands in the parent's store.
        let history = memory.load_recent_history(&parent(), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].digest.starts_with("[subagent math]"));
    }

    #[tokio::test]
    async fn subagent_tools_exclude_spawn() {
        let (bus, _rx) = MessageBus::new(8);
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let manager = SubagentManager::new(provider.clone(), Arc::new(InMemoryStore::new()), bus);

        let base = ToolRegistry::new().with(Arc::new(CountingTool::new("read_file")));
        let spawn = SpawnTool::new(manager.clone(), parent(), TurnId::new(), base.clone());
        let tools = base.with(Arc::new(spawn));
        assert_eq!(tools.names(), vec!["read_file", "spawn"]);

        manager.spawn(parent(), TurnId::new(), None, "look".into(), tools).await.join().await;
        let requests = provider.requests();
        let offered: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec!["read_file"]);
    }

    #[tokio::test]
    async fn cancel_by_session_stops_waiting_tasks() {
        let (bus, mut rx) = MessageBus::new(8);
        let provider = Arc::new(SequentialMockProvider::single_text("never"));
        let manager = SubagentManager::new(provider.clone(), Arc::new(InMemoryStore::new()), bus)
            .with_config(SubagentConfig { max_iterations: 15, max_concurrent: 1 });

        // Hold the only slot so the spawned task waits.
        let slot = manager.semaphore.clone().acquire_owned().await.unwrap();
        let handle = manager
            .spawn(parent(), TurnId::new(), None, "wait".into(), ToolRegistry::new())
            .await;
        assert_eq!(manager.running_count().await, 1);

        assert_eq!(manager.cancel_by_session(&SessionKey::new("other", "x")).await, 0);
        assert_eq!(manager.cancel_by_session(&parent()).await, 1);
        handle.join().await;
        drop(slot);

        let InboundEvent::SubagentResult(report) = rx.inbound.recv().await.unwrap() else {
            panic!("expected a subagent result");
        };
        assert_eq!(report.outcome, "cancelled");
        assert_eq!(provider.call_count(), 0);
        assert_eq!(manager.running_count().await, 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (bus, _rx) = MessageBus::new(8);
        let manager = SubagentManager::new(
            Arc::new(SequentialMockProvider::single_text("ok")),
            Arc::new(InMemoryStore::new()),
            bus,
        )
        .with_config(SubagentConfig { max_iterations: 15, max_concurrent: 2 });
        assert_eq!(manager.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn subagent_sees_parent_facts() {
        let parent_memory = Arc::new(InMemoryStore::new());
        parent_memory
            .upsert_facts(&parent(), vec![MemoryFact::new("User lives in Lisbon", 0.9)])
            .await
            .unwrap();
        let (bus, _rx) = MessageBus::new(8);
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let manager = SubagentManager::new(provider.clone(), parent_memory.clone(), bus);

        manager
            .spawn(parent(), TurnId::new(), None, "weather".into(), ToolRegistry::new())
            .await
            .join()
            .await;

        let requests = provider.requests();
        assert!(requests[0].messages[0].content.contains("User lives in Lisbon"));
    }

    #[tokio::test]
    async fn snapshot_memory_defers_writes() {
        let target = InMemoryStore::new();
        let snap = SnapshotMemory::new(FactsSnapshot::default());
        snap.upsert_facts(&parent(), vec![MemoryFact::new("deferred fact", 0.8)])
            .await
            .unwrap();
        assert!(target.load_facts_snapshot(&parent()).await.unwrap().is_empty());
        assert_eq!(snap.load_facts_snapshot(&parent()).await.unwrap().len(), 1);

        snap.flush(&target, &parent()).await.unwrap();
        assert_eq!(target.load_facts_snapshot(&parent()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawn_tool_requires_task() {
        let (bus, _rx) = MessageBus::new(8);
        let manager = SubagentManager::new(
            Arc::new(SequentialMockProvider::single_text("ok")),
            Arc::new(InMemoryStore::new()),
            bus,
        );
        let tool = SpawnTool::new(manager.clone(), parent(), TurnId::new(), ToolRegistry::new());
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let ok = tool.execute(json!({"task": "summarize", "label": "sum"})).await.unwrap();
        assert!(ok.output.starts_with("Subagent [sum] started"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
