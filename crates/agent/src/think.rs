//! Stripping of model reasoning blocks (`<think>…</think>` and friends).
//!
//! Handles nested pairs, an unclosed trailing block and orphaned closing
//! tags. Matching is ASCII case-insensitive.

pub const REASONING_TAGS: [&str; 4] = ["think", "reasoning", "thought", "inner_monologue"];

/// Remove every reasoning block. Returns `None` when nothing visible is left.
pub fn strip_reasoning(text: &str) -> Option<String> {
    let mut result = text.to_string();
    for tag in REASONING_TAGS {
        result = strip_tag(&result, tag);
    }
    let trimmed = result.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_tag(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = text.to_string();

    // Peel innermost balanced pairs: the first close paired with the last
    // open before it.
    loop {
        let lower = out.to_ascii_lowercase();
        let Some(close_at) = lower.find(&close) else {
            break;
        };
        let Some(open_at) = lower[..close_at].rfind(&open) else {
            break;
        };
        out.replace_range(open_at..close_at + close.len(), "");
    }

    // Unclosed trailing block.
    let lower = out.to_ascii_lowercase();
    if let Some(open_at) = lower.find(&open) {
        out.truncate(open_at);
    }

    // Orphaned closing tags.
    loop {
        let lower = out.to_ascii_lowercase();
        let Some(close_at) = lower.find(&close) else {
            break;
        };
        out.replace_range(close_at..close_at + close.len(), "");
    }
    out
}
