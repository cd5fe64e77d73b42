//! `snapclaw memory` — Inspect the facts layer, history and sessions.

use super::{CLI_CHANNEL, load_config, open_stores};
use snapclaw_core::memory::FactsSnapshot;
use snapclaw_core::session::SessionKey;

pub async fn facts(chat_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let stores = open_stores(&config);
    let key = SessionKey::new(CLI_CHANNEL, chat_id);

    let snapshot = stores.memory.load_facts_snapshot(&key).await?;
    println!("🧠 Facts for {key} ({} backend)", stores.memory.name());
    println!("====================");
    print!("{}", render_facts(&snapshot));
    Ok(())
}

pub async fn history(chat_id: &str, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let stores = open_stores(&config);
    let key = SessionKey::new(CLI_CHANNEL, chat_id);

    let entries = stores.memory.load_recent_history(&key, limit).await?;
    println!("📜 History for {key}");
    println!("====================");
    if entries.is_empty() {
        println!("   No history yet.");
    }
    for entry in entries {
        println!("  {} {}", entry.timestamp.format("%Y-%m-%d %H:%M"), entry.digest);
        if !entry.topic_tags.is_empty() {
            println!("      tags: {}", entry.topic_tags.join(", "));
        }
    }
    Ok(())
}

pub async fn sessions() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let stores = open_stores(&config);

    let keys = stores.sessions.list().await?;
    if keys.is_empty() {
        println!("   No sessions yet.");
    }
    for key in keys {
        let session = stores.sessions.get_or_create(&key).await?;
        println!(
            "  {key:<30} mode={:<7} turns={:<4} updated={}",
            session.mode,
            session.turns.len(),
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn render_facts(snapshot: &FactsSnapshot) -> String {
    if snapshot.facts.is_empty() {
        return "   No facts stored.\n".to_string();
    }
    snapshot
        .ranked()
        .iter()
        .enumerate()
        .map(|(i, fact)| format!("  {:>2}. [{:.2}] {}\n", i + 1, fact.salience, fact.text))
        .collect()
}
