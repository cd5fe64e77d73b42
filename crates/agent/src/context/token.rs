//! Token estimation.
//!
//! Character heuristic: one token per four bytes, rounded up, plus a fixed
//! per-message overhead for role and framing. Compression budgets are checked
//! with these numbers, so they must be deterministic, not exact.

use snapclaw_core::message::Message;
use snapclaw_core::provider::ToolDefinition;

/// Per-message framing overhead in tokens.
pub const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Content, tool-call names and arguments, plus framing.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
        .sum();
    MESSAGE_OVERHEAD + estimate_tokens(&message.content) + calls
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Tokens for tool schemas as they go over the wire.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}

/// Longest suffix of `text` (starting on a char boundary) that fits in
/// `tokens`.
pub fn tail_to_tokens(text: &str, tokens: usize) -> &str {
    let max_bytes = tokens.saturating_mul(4);
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapclaw_core::message::MessageToolCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn message_includes_overhead_and_calls() {
        assert_eq!(estimate_message_tokens(&Message::user("test")), 5);

        let msg = Message::assistant_tool_calls(
            "",
            vec![MessageToolCall {
                id: "c".into(),
                name: "read".into(),
                arguments: "{\"p\":1}".into(),
            }],
        );
        // 4 overhead + 0 content + 1 name + 2 args
        assert_eq!(estimate_message_tokens(&msg), 7);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "ééééé"; // 10 bytes
        assert_eq!(tail_to_tokens(text, 1), "éé");
        assert_eq!(tail_to_tokens("abcdefghij", 1), "ghij");
        assert_eq!(tail_to_tokens("short", 10), "short");
        assert_eq!(tail_to_tokens("abc", 0), "");
        assert!(estimate_tokens(tail_to_tokens(&"x".repeat(99), 7)) <= 7);
    }

    #[test]
    fn tools_have_cost() {
        let tool = ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert!(estimate_tools_tokens(&[tool]) > 0);
        assert_eq!(estimate_tools_tokens(&[]), 0);
    }
}
