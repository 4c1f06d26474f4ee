//! # Text Processing Utilities
//!
//! Redaction helpers used before resolved options or environment maps are
//! written to the log.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Key fragments whose values are never logged.
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "API_KEY",
    "AUTH",
    "CREDENTIAL",
    "DATABASE_URL",
    "PASSWORD",
    "PRIVATE_KEY",
    "SECRET",
    "TOKEN",
];

/// Redacts values that look like secrets in a string.
///
/// # Example
/// ```rust
/// use pollflow_util::text_processing::redact_sensitive;
///
/// let input = "API_KEY=abc123 TOKEN=xyz789";
/// assert_eq!(redact_sensitive(input), "API_KEY=[REDACTED] TOKEN=[REDACTED]");
///
/// let input = "Authorization: Bearer secret123";
/// assert_eq!(redact_sensitive(input), "Authorization: [REDACTED]");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in get_redact_patterns().iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}{REDACTED}")
            })
            .to_string();
    }
    redacted
}

/// Returns `true` when an object key names a secret-bearing value.
pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_KEY_FRAGMENTS.iter().any(|fragment| upper.contains(fragment))
}

/// Recursively redacts sensitive data from JSON values.
///
/// Values stored under secret-looking keys are replaced wholesale; every other
/// string goes through [`redact_sensitive`].
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_sensitive(text)),
        Value::Array(values) => Value::Array(values.iter().map(redact_json).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, nested) in map.iter() {
                let redacted = if is_secret_key(key) && !nested.is_null() {
                    Value::String(REDACTED.to_string())
                } else {
                    redact_json(nested)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn get_redact_patterns() -> &'static Vec<Regex> {
    static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        vec![
            Regex::new(r"(?i)(authorization:\s+)([^\s]+(?:\s+[^\s]+)*)").unwrap(),
            Regex::new(r"(?i)((?:^|\b)Bearer\s+)([A-Za-z0-9\-._~+/]+=*)").unwrap(),
            Regex::new(r"(?i)((?:export\s+)?[A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)").unwrap(),
            Regex::new(r"(?i)(DATABASE_URL=)([^\s]+)").unwrap(),
        ]
    });

    &REDACT_PATTERNS
}
