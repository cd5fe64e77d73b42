//! Agent identity — the stable system prompt.
//!
//! Bootstrap files are read from the workspace directory in a fixed order:
//! `AGENTS.md`, `SOUL.md`, `USER.md`, `TOOLS.md`, `IDENTITY.md`. Each one is
//! optional; missing or empty files are skipped. With nothing on disk the
//! built-in prompt is used.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const BOOTSTRAP_FILES: [&str; 5] = ["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub system_prompt: String,
    /// Files that contributed to the prompt (for diagnostics)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded_files: Vec<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: "SnapClaw".into(),
            system_prompt: Self::fallback_system_prompt("SnapClaw"),
            loaded_files: Vec::new(),
        }
    }
}

impl Identity {
    fn fallback_system_prompt(name: &str) -> String {
        format!(
            "You are {name}, a helpful personal assistant. \
             Use the tools you are given when they help, and answer directly when they do not. \
             Be concise and accurate. Never repeat a tool call whose result you already have."
        )
    }

    /// Use a fixed prompt and skip file loading.
    pub fn with_prompt(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            loaded_files: vec!["<override>".into()],
        }
    }

    /// Load bootstrap files from `workspace`, falling back to the built-in prompt.
    pub fn load(name: &str, workspace: Option<&Path>) -> Self {
        let Some(dir) = workspace else {
            return Self {
                name: name.to_string(),
                system_prompt: Self::fallback_system_prompt(name),
                loaded_files: Vec::new(),
            };
        };

        let mut sections = vec![Self::fallback_system_prompt(name)];
        let mut loaded_files = Vec::new();
        for file in BOOTSTRAP_FILES {
            let path: PathBuf = dir.join(file);
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) if !content.trim().is_empty() => {
                    debug!(file = %path.display(), "Loaded bootstrap file");
                    sections.push(format!("## {file}\n\n{}", content.trim()));
                    loaded_files.push(path.display().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to read bootstrap file"),
            }
        }

        Self {
            name: name.to_string(),
            system_prompt: sections.join("\n\n---\n\n"),
            loaded_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_workspace_uses_fallback() {
        let id = Identity::load("Claw", None);
        assert!(id.system_prompt.contains("You are Claw"));
        assert!(id.loaded_files.is_empty());
    }

    #[test]
    fn bootstrap_files_are_appended_in_order() {
        let dir = std::env::temp_dir().join(format!("snapclaw-identity-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("USER.md"), "Prefers metric units.").unwrap();
        std::fs::write(dir.join("AGENTS.md"), "Always cite sources.").unwrap();
        std::fs::write(dir.join("SOUL.md"), "   ").unwrap();

        let id = Identity::load("Claw", Some(&dir));
        let agents = id.system_prompt.find("Always cite sources").unwrap();
        let user = id.system_prompt.find("Prefers metric units").unwrap();
        assert!(agents < user);
        assert_eq!(id.loaded_files.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }
}
