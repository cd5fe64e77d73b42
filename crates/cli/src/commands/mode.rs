//! `snapclaw mode` — Switch a session's mode through its slash command.

use super::{CLI_CHANNEL, build_runtime, load_config, open_stores, print_key_help};
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Normal,
    Plan,
    Doctor,
    /// Leave doctor mode
    DoctorCancel,
    /// Report doctor status without changing anything
    Status,
}

impl ModeArg {
    pub fn command(self) -> &'static str {
        match self {
            Self::Normal => "/normal",
            Self::Plan => "/plan",
            Self::Doctor => "/doctor",
            Self::DoctorCancel => "/doctor cancel",
            Self::Status => "/doctor status",
        }
    }
}

pub async fn run(mode: ModeArg, chat_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let stores = open_stores(&config);
    let wired = match build_runtime(&config, &stores) {
        Ok(wired) => wired,
        Err(e) => {
            print_key_help();
            return Err(e);
        }
    };

    let reply = wired
        .runtime
        .process_direct(CLI_CHANNEL, chat_id, mode.command(), None)
        .await?;
    println!("{reply}");
    Ok(())
}
