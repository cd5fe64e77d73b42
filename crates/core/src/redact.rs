//! Redaction for log fields.
//!
//! Message previews, memory facts and tool arguments end up in traces. Before
//! they do, e-mail addresses are masked and anything that looks like a
//! credential is replaced with [`REDACTED`].

use regex_lite::{Captures, Regex};
use std::sync::LazyLock;

pub const REDACTED: &str = "***REDACTED***";

const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "sessionid",
    "private_key",
];

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z0-9._%+-]+)@([A-Za-z0-9.-]+\.[A-Za-z]{2,})\b").ok());

static BEARER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._-]+").ok());

static SECRET_VALUES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bsk-[A-Za-z0-9_-]{8,}",
        r"\bxox[baprs]-[A-Za-z0-9-]{10,}",
        r"\bgh[pousr]_[A-Za-z0-9]{20,}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Whether a field named `key` holds a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.to_lowercase().replace('-', "_");
    SENSITIVE_KEYS.iter().any(|k| normalized.contains(k))
}

/// `jane.doe@example.com` becomes `j***@e***.com`.
fn mask_email(caps: &Captures<'_>) -> String {
    let local = caps.get(1).map_or("", |m| m.as_str());
    let domain = caps.get(2).map_or("", |m| m.as_str());
    let (head, suffix) = domain.split_once('.').unwrap_or((domain, ""));
    let first = |s: &str| s.chars().next().map_or_else(|| "***".to_string(), |c| format!("{c}***"));
    if suffix.is_empty() {
        format!("{}@{}", first(local), first(head))
    } else {
        format!("{}@{}.{suffix}", first(local), first(head))
    }
}

/// Mask e-mail addresses, bearer tokens and well-known API key formats.
pub fn redact_text(text: &str) -> String {
    let mut out = match (*EMAIL).as_ref() {
        Some(re) => re.replace_all(text, |caps: &Captures<'_>| mask_email(caps)).into_owned(),
        None => text.to_string(),
    };
    if let Some(re) = (*BEARER).as_ref() {
        out = re.replace_all(&out, format!("Bearer {REDACTED}").as_str()).into_owned();
    }
    for re in SECRET_VALUES.iter() {
        out = re.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// Redacted copy of a JSON value: sensitive keys lose their value entirely,
/// strings everywhere else go through [`redact_text`].
pub fn redact_value(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(v)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) => Value::String(redact_text(s)),
        other => other.clone(),
    }
}

/// Short, redacted, single-line form of `text` for log fields.
pub fn preview(text: &str, max: usize) -> String {
    crate::memory::snippet(&redact_text(text), max)
}
