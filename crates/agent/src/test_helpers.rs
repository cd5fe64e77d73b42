//! Shared test helpers: scripted providers and counting tools.

use async_trait::async_trait;
use snapclaw_core::bus::MessageBus;
use snapclaw_core::error::{ProviderError, ToolError};
use snapclaw_core::message::{Message, MessageToolCall};
use snapclaw_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use snapclaw_core::session::SessionKey;
use snapclaw_core::tool::{Tool, ToolResult};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Returns scripted responses in order. Once the script runs out the last
/// response repeats, which is how "the model never stops calling tools" is
/// modelled.
pub struct SequentialMockProvider {
    responses: Vec<Result<ProviderResponse, ProviderError>>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::scripted(responses.into_iter().map(Ok).collect())
    }

    pub fn scripted(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        assert!(!responses.is_empty(), "script needs at least one response");
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        let idx = n.min(self.responses.len() - 1);
        self.responses[idx].clone()
    }
}

/// Publishes one user event for `session` while answering the first request,
/// the way a message arriving mid-call would.
pub struct InterruptingProvider {
    pub inner: SequentialMockProvider,
    bus: MessageBus,
    session: SessionKey,
    event: String,
    fired: AtomicBool,
}

impl InterruptingProvider {
    pub fn new(responses: Vec<ProviderResponse>, bus: MessageBus, session: SessionKey, event: &str) -> Self {
        Self {
            inner: SequentialMockProvider::new(responses),
            bus,
            session,
            event: event.to_string(),
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Provider for InterruptingProvider {
    fn name(&self) -> &str {
        "interrupting_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.bus.publish_event(&self.session, self.event.clone());
        }
        self.inner.complete(request).await
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: usage(),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_tool_calls(thought, tool_calls),
        usage: usage(),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// A tool that counts invocations and echoes its arguments.
pub struct CountingTool {
    name: String,
    calls: AtomicUsize,
    fail: bool,
}

impl CountingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts calls"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: "boom".into(),
            });
        }
        Ok(ToolResult::ok(format!("{} #{n}: {arguments}", self.name)))
    }
}
