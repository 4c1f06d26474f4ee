//! Typed errors for the failure classes callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

/// Template parsing and evaluation failures. Any of them fails the declaration
/// being resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated template starting at byte {position} in '{template}'")]
    Unterminated { template: String, position: usize },

    #[error("empty template expression in '{template}'")]
    EmptyExpression { template: String },

    #[error("unknown expression root '{root}' in '{expression}'; expected 'ctx' or 'env'")]
    UnknownRoot { root: String, expression: String },

    #[error("malformed expression '{expression}': {reason}")]
    Malformed { expression: String, reason: String },
}

/// Engine failures with a stable shape.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("items at path '{path}' are not an array (found {found})")]
    ItemsNotArray { path: String, found: &'static str },

    #[error("Invalid filter step result: expected an array of {expected} booleans, got {found}")]
    InvalidFilterResult { expected: usize, found: String },

    #[error("assertion failed: {expression}")]
    AssertionFailed { expression: String },

    #[error("no action handler registered as '{name}'")]
    UnknownHandler { name: String },

    #[error("filterFrom and filterItemsFrom cannot both be set on the same source")]
    ConflictingFilterStrategy,

    #[error("{strategy} selects items by reference and cannot be combined with {option}")]
    ConflictingExtractionStrategy { strategy: &'static str, option: &'static str },

    #[error("no source output named '{name}' to select items from")]
    UnknownOutputReference { name: String },

    #[error("command exited with code {code}: {command}{}", format_stderr(.stderr))]
    CommandFailed { command: String, code: i32, stderr: String },

    #[error("workflow patterns and inline content are mutually exclusive")]
    ConflictingInputs,
}

/// Returned by a batch in which at least one workflow failed.
///
/// The remaining workflows still ran; `workflows` lists the failed relative paths.
#[derive(Debug, Error)]
#[error("{failed} of {total} workflows failed: {}", .workflows.join(", "))]
pub struct BatchRunError {
    pub failed: usize,
    pub total: usize,
    pub workflows: Vec<String>,
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() { String::new() } else { format!(" ({trimmed})") }
}

/// Short JSON type name used in error messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
