//! `snapclaw chat` — Interactive or single-message chat mode.

use super::{CLI_CHANNEL, build_runtime, load_config, open_stores, print_key_help};
use snapclaw_agent::TurnEvent;
use snapclaw_core::bus::{BusReceivers, InboundEvent, InboundMessage, OutboundMessage};
use snapclaw_core::session::SessionKey;
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

pub async fn run(message: Option<String>, chat_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let stores = open_stores(&config);
    let wired = match build_runtime(&config, &stores) {
        Ok(wired) => wired,
        Err(e) => {
            print_key_help();
            return Err(e);
        }
    };
    let runtime = wired.runtime;
    let key = SessionKey::new(CLI_CHANNEL, chat_id);

    if let Some(msg) = message {
        // Single message mode
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_progress(rx));

        let reply = runtime.process_direct(CLI_CHANNEL, chat_id, &msg, Some(tx)).await?;
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
        println!("{reply}");

        runtime.flush_background().await;
        let pending = runtime.subagents().cancel_by_session(&key).await;
        if pending > 0 {
            eprintln!("  ({pending} background task(s) cancelled on exit)");
        }
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        SnapClaw Agent — Interactive Mode     ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Model:     {}", config.default_model);
    println!("  Session:   {key}");
    println!("  Memory:    {}", stores.memory.name());
    println!("  Agent:     {}", runtime.orchestrator().builder().identity().name);
    println!();
    println!("  Type your message and press Enter. /help lists commands.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let BusReceivers { inbound, outbound } = wired.receivers;
    let worker = runtime.clone();
    let runner = tokio::spawn(async move { worker.run(inbound).await });
    let printer = tokio::spawn(print_outbound(outbound));

    prompt()?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            prompt()?;
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        let event = InboundEvent::UserMessage(InboundMessage::new(CLI_CHANNEL, chat_id, line));
        wired.bus.publish_inbound(event).await?;
    }

    runtime.subagents().cancel_by_session(&key).await;
    runtime.flush_background().await;
    runner.abort();
    printer.abort();

    println!();
    println!("  Goodbye! 👋");
    println!();
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<TurnEvent>) {
    while let Some(event) = rx.recv().await {
        if let Some(text) = event.progress_text() {
            eprintln!("  ... {text}");
        }
    }
}

async fn print_outbound(mut rx: mpsc::Receiver<OutboundMessage>) {
    while let Some(msg) = rx.recv().await {
        if msg.progress {
            eprintln!("\r  ... {}", msg.content);
            continue;
        }
        println!();
        for line in msg.content.lines() {
            println!("  Assistant > {line}");
        }
        println!();
        if prompt().is_err() {
            break;
        }
    }
}
