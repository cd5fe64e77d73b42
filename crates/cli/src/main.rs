//! SnapClaw CLI — the main entry point.
//!
//! Commands:
//! - `chat`    — Interactive chat or single-message mode
//! - `memory`  — Inspect facts, history and sessions
//! - `config`  — Show, initialize or validate configuration
//! - `mode`    — Switch a session between normal, plan and doctor mode

use clap::{Parser, Subcommand};

mod commands;

use commands::mode::ModeArg;

#[derive(Parser)]
#[command(
    name = "snapclaw",
    about = "SnapClaw — a personal conversational agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Chat id within the `cli` channel
        #[arg(short, long, default_value = commands::DEFAULT_CHAT_ID)]
        session: String,
    },

    /// Inspect persistent memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Switch a session's mode
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,

        #[arg(short, long, default_value = commands::DEFAULT_CHAT_ID)]
        session: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Show the facts layer, highest salience first
    Facts {
        #[arg(short, long, default_value = commands::DEFAULT_CHAT_ID)]
        session: String,
    },

    /// Show recent history digests
    History {
        #[arg(short, long, default_value = commands::DEFAULT_CHAT_ID)]
        session: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// List known sessions
    Sessions,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (API key redacted)
    Show,
    /// Write a default config file if none exists
    Init,
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { message, session } => commands::chat::run(message, &session).await?,
        Commands::Memory { action } => match action {
            MemoryAction::Facts { session } => commands::memory::facts(&session).await?,
            MemoryAction::History { session, limit } => commands::memory::history(&session, limit).await?,
            MemoryAction::Sessions => commands::memory::sessions().await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Init => commands::config_cmd::init().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
        Commands::Mode { mode, session } => commands::mode::run(mode, &session).await?,
    }

    Ok(())
}
