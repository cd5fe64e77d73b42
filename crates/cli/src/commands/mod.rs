//! Subcommand implementations and the wiring they share.

pub mod chat;
pub mod config_cmd;
pub mod memory;
pub mod mode;

use snapclaw_agent::{AgentRuntime, ContextBuilder, ContextCompressor, ConversationOrchestrator, SubagentManager};
use snapclaw_config::{AppConfig, MemoryBackend};
use snapclaw_core::bus::{BusReceivers, MessageBus};
use snapclaw_core::event::EventBus;
use snapclaw_core::memory::MemoryStore;
use snapclaw_core::provider::Provider;
use snapclaw_core::session::SessionStore;
use snapclaw_core::tool::ToolRegistry;
use snapclaw_memory::{FileMemoryStore, FileSessionStore, InMemorySessionStore, InMemoryStore, NoopMemory};
use snapclaw_providers::OpenAiCompatProvider;
use std::sync::Arc;
use tracing::debug;

pub const CLI_CHANNEL: &str = "cli";
pub const DEFAULT_CHAT_ID: &str = "direct";
const BUS_CAPACITY: usize = 64;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Session and memory stores for the configured backend.
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub memory: Arc<dyn MemoryStore>,
}

pub fn open_stores(config: &AppConfig) -> Stores {
    let capacity = config.memory.facts_capacity;
    match config.memory.backend {
        MemoryBackend::File => {
            let root = config.data_dir();
            debug!(root = %root.display(), "Using file-backed stores");
            Stores {
                sessions: Arc::new(FileSessionStore::new(root.join("sessions"))),
                memory: Arc::new(FileMemoryStore::with_capacity(root.join("memory"), capacity)),
            }
        }
        MemoryBackend::InMemory => Stores {
            sessions: Arc::new(InMemorySessionStore::new()),
            memory: Arc::new(InMemoryStore::with_capacity(capacity)),
        },
        MemoryBackend::None => Stores {
            sessions: Arc::new(InMemorySessionStore::new()),
            memory: Arc::new(NoopMemory),
        },
    }
}

/// A runtime plus the bus ends a transport needs.
pub struct Wired {
    pub runtime: AgentRuntime,
    pub bus: MessageBus,
    pub receivers: BusReceivers,
}

/// Build the full engine from configuration: provider, compressor,
/// context builder, orchestrator, subagents and runtime.
pub fn build_runtime(config: &AppConfig, stores: &Stores) -> Result<Wired, Box<dyn std::error::Error>> {
    let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::from_config(config)?);
    let sampling = config.sampling();
    let identity = config.identity();
    let events = Arc::new(EventBus::default());

    let mut compressor = ContextCompressor::new(config.compression.clone(), Arc::clone(&stores.memory))
        .with_events(Arc::clone(&events));
    if config.compression.model_backed {
        compressor = compressor.with_model(Arc::clone(&provider), sampling.clone());
    }

    let builder = Arc::new(
        ContextBuilder::new(identity.clone(), Arc::new(compressor))
            .with_content_tagging(config.agent.content_tagging)
            .with_event_handling(config.agent.enable_event_handling),
    );
    let orchestrator = ConversationOrchestrator::new(Arc::clone(&provider), Arc::clone(&stores.sessions), builder)
        .with_config(config.agent.clone())
        .with_sampling(sampling.clone())
        .with_events(Arc::clone(&events));

    let (bus, receivers) = MessageBus::new(BUS_CAPACITY);
    let subagents = SubagentManager::new(provider, Arc::clone(&stores.memory), bus.clone())
        .with_config(config.subagents.clone())
        .with_identity(identity)
        .with_agent_config(config.agent.clone())
        .with_compression(config.compression.clone())
        .with_sampling(sampling)
        .with_events(events);

    let runtime = AgentRuntime::new(
        orchestrator,
        Arc::clone(&stores.memory),
        subagents,
        ToolRegistry::new(),
        bus.clone(),
    );

    Ok(Wired { runtime, bus, receivers })
}

/// Explain how to configure a key. Printed when the provider can't be built.
pub fn print_key_help() {
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    OPENROUTER_API_KEY = 'sk-or-v1-...'   (recommended)");
    eprintln!("    OPENAI_API_KEY     = 'sk-...'         (with SNAPCLAW_API_URL=https://api.openai.com/v1)");
    eprintln!("    SNAPCLAW_API_KEY   = 'sk-...'         (generic)");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
}
