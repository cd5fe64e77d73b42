//! Turn progress events.
//!
//! `TurnEvent`s are emitted while a turn runs so a transport can show what
//! the agent is doing (the model's stated intent, tool hints, nudges) before
//! the final answer arrives.

use snapclaw_core::message::MessageToolCall;
use snapclaw_core::provider::Usage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Where progress events go. Send errors are ignored: a gone listener must
/// not affect the turn.
pub type ProgressSink = mpsc::UnboundedSender<TurnEvent>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Text the model produced alongside tool calls.
    Thought { step: u32, content: String },

    /// A `**Plan:**` checklist found in the model's text.
    Plan { step: u32, content: String },

    /// Human-readable summary of the tool calls about to run.
    ToolHint { step: u32, hint: String },

    /// One tool call resolved.
    ToolResult {
        step: u32,
        name: String,
        success: bool,
        cached: bool,
    },

    /// The loop guard will inject a corrective instruction.
    Nudge { step: u32, message: String },

    /// The turn ended.
    Done {
        turn_id: String,
        outcome: String,
        iterations: u32,
        usage: Usage,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Plan { .. } => "plan",
            Self::ToolHint { .. } => "tool_hint",
            Self::ToolResult { .. } => "tool_result",
            Self::Nudge { .. } => "nudge",
            Self::Done { .. } => "done",
        }
    }

    /// Text suitable for a progress message, if this event has one.
    pub fn progress_text(&self) -> Option<String> {
        match self {
            Self::Thought { content, .. } => Some(content.clone()),
            Self::Plan { content, .. } => Some(format!("\u{1f4cb} {content}")),
            Self::ToolHint { hint, .. } => Some(hint.clone()),
            Self::ToolResult { .. } | Self::Nudge { .. } | Self::Done { .. } => None,
        }
    }
}

fn tool_display(name: &str) -> (&'static str, Option<&'static str>) {
    match name {
        "web_search" => ("\u{1f50d}", Some("Searching")),
        "web_fetch" => ("\u{1f310}", Some("Fetching page")),
        "read_file" => ("\u{1f4d6}", Some("Reading file")),
        "write_file" => ("\u{270f}\u{fe0f}", Some("Writing file")),
        "edit_file" => ("\u{1f4dd}", Some("Editing file")),
        "list_dir" => ("\u{1f4c2}", Some("Listing dir")),
        "exec" => ("\u{26a1}", Some("Running command")),
        "message" => ("\u{1f4ac}", Some("Sending message")),
        "cron" => ("\u{23f0}", Some("Scheduling")),
        "spawn" => ("\u{1f504}", Some("Spawning subtask")),
        _ => ("\u{1f527}", None),
    }
}

const HINT_ARG_CHARS: usize = 60;

/// `[Step n] 🔍 Searching: rust async | 📖 Reading file: notes.md`
pub fn tool_hint(calls: &[MessageToolCall], step: u32) -> String {
    let parts: Vec<String> = calls
        .iter()
        .map(|call| {
            let (emoji, label) = tool_display(&call.name);
            let label = label.unwrap_or(call.name.as_str());
            let first_arg = call
                .parsed_arguments()
                .ok()
                .and_then(|v| v.as_object().and_then(|m| m.values().next().cloned()))
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty());
            match first_arg {
                Some(arg) if arg.chars().count() > HINT_ARG_CHARS => {
                    let short: String = arg.chars().take(HINT_ARG_CHARS).collect();
                    format!("{emoji} {label}: {short}\u{2026}")
                }
                Some(arg) => format!("{emoji} {label}: {arg}"),
                None => format!("{emoji} {label}"),
            }
        })
        .collect();
    let prefix = if step > 0 { format!("[Step {step}] ") } else { String::new() };
    format!("{prefix}{}", parts.join(" | "))
}

/// Pull a `**Plan:**` block of numbered checklist lines out of model text.
pub fn extract_plan(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("**plan:**")?;
    let mut lines = vec![text[start..start + "**plan:**".len()].to_string()];
    for line in text[start..].lines().skip(1) {
        let trimmed = line.trim_start();
        let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
        let rest = &trimmed[digits..];
        let is_item = digits > 0
            && rest.starts_with('.')
            && {
                let after = rest[1..].trim_start();
                after.starts_with("[ ]") || after.starts_with("[x]") || after.starts_with("[X]")
            };
        if !is_item {
            break;
        }
        lines.push(trimmed.trim_end().to_string());
    }
    if lines.len() < 2 {
        return None;
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> MessageToolCall {
        MessageToolCall {
            id: format!("call_{name}"),
            name: name.into(),
            arguments: args.into(),
        }
    }

    #[test]
    fn hint_uses_labels_and_step_prefix() {
        let hint = tool_hint(
            &[
                call("web_search", r#"{"query":"rust async"}"#),
                call("custom_tool", "{}"),
            ],
            3,
        );
        assert_eq!(hint, "[Step 3] \u{1f50d} Searching: rust async | \u{1f527} custom_tool");
    }

    #[test]
    fn hint_truncates_long_arguments() {
        let long = "x".repeat(100);
        let hint = tool_hint(&[call("read_file", &format!(r#"{{"path":"{long}"}}"#))], 0);
        assert!(hint.ends_with('\u{2026}'));
        assert!(!hint.starts_with("[Step"));
    }

    #[test]
    fn plan_extraction() {
        let text = "Sure.\n**Plan:**\n1. [ ] Search docs\n2. [x] Read file\nThen I'll act.";
        let plan = extract_plan(text).unwrap();
        assert_eq!(plan, "**Plan:**\n1. [ ] Search docs\n2. [x] Read file");
        assert!(extract_plan("no plan here").is_none());
        assert!(extract_plan("**Plan:**\nnothing numbered").is_none());
    }

    #[test]
    fn event_serialization() {
        let event = TurnEvent::ToolHint { step: 1, hint: "x".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_hint""#));
        assert_eq!(event.event_type(), "tool_hint");
        assert_eq!(event.progress_text().as_deref(), Some("x"));
    }
}
