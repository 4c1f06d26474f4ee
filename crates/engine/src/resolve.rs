//! # Template Resolution
//!
//! Resolves `${{ ... }}` templates embedded in declaration values against the
//! serialized public context.
//!
//! - A string that is exactly one template resolves to the expression's JSON
//!   value, so `${{ ctx.items }}` stays an array.
//! - Otherwise every template is rendered to text and spliced into the string
//!   (`null` renders empty, objects and arrays render as JSON).
//! - Arrays and objects are resolved recursively.
//!
//! ## Usage
//!
//! ```rust
//! use pollflow_engine::resolve::interpolate_value;
//! use serde_json::json;
//!
//! let scope = json!({ "env": { "REGION": "eu" }, "item": { "id": 7 } });
//! let value = json!({
//!     "url": "https://api.example.com/${{ env.REGION }}/items/${{ ctx.item.id }}",
//!     "id": "${{ ctx.item.id }}"
//! });
//!
//! let resolved = interpolate_value(&value, &scope)?;
//! assert_eq!(resolved["url"], "https://api.example.com/eu/items/7");
//! assert_eq!(resolved["id"], 7);
//! # Ok::<(), pollflow_engine::TemplateError>(())
//! ```

use serde_json::Value;

use crate::error::TemplateError;
use crate::expression::{evaluate_expression, is_truthy};
use crate::templates::{TemplateSegment, parse_template, whole_expression};

/// Recursively interpolates all template expressions in a JSON value.
pub fn interpolate_value(value: &Value, scope: &Value) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) => interpolate_string(text, scope),
        Value::Array(values) => values
            .iter()
            .map(|nested| interpolate_value(nested, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut interpolated = serde_json::Map::new();
            for (key, nested) in map {
                interpolated.insert(key.clone(), interpolate_value(nested, scope)?);
            }
            Ok(Value::Object(interpolated))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves a single string, preserving the expression's type when the string
/// is exactly one template.
pub fn interpolate_string(text: &str, scope: &Value) -> Result<Value, TemplateError> {
    if let Some(expression) = whole_expression(text)? {
        return evaluate_expression(expression, scope);
    }

    let segments = parse_template(text)?;
    if !segments.iter().any(|segment| matches!(segment, TemplateSegment::Expression(_))) {
        return Ok(Value::String(text.to_string()));
    }

    let mut rendered = String::with_capacity(text.len());
    for segment in segments {
        match segment {
            TemplateSegment::Literal(literal) => rendered.push_str(literal),
            TemplateSegment::Expression(expression) => {
                rendered.push_str(&format_json_value(&evaluate_expression(expression, scope)?));
            }
        }
    }
    Ok(Value::String(rendered))
}

/// Evaluates a bare expression (an optional `${{ }}` wrapper is stripped) for truthiness.
pub fn eval_condition(expression: &str, scope: &Value) -> Result<bool, TemplateError> {
    let normalized = crate::templates::normalize_expression(expression)?;
    if normalized.is_empty() {
        return Err(TemplateError::EmptyExpression {
            template: expression.to_string(),
        });
    }
    Ok(is_truthy(&evaluate_expression(&normalized, scope)?))
}

/// Select a nested JSON value by a minimal dot path with optional indices.
///
/// Supports segments like `a`, `a.b`, and `a[0].b[1]`. An index applied to an
/// object looks up the stringified key. Returns `None` when any segment is
/// missing. When `path` is `None` or blank, `value` is returned as-is.
pub fn select_path<'v>(value: &'v Value, path: Option<&str>) -> Option<&'v Value> {
    let Some(path) = path else {
        return Some(value);
    };
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in trimmed.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = step_into(current, key)?;
        }
        for index in indices {
            current = step_into(current, index)?;
        }
    }
    Some(current)
}

fn step_into<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(values) => values.get(key.parse::<usize>().ok()?),
        _ => None,
    }
}

fn split_indices(segment: &str) -> (&str, Vec<&str>) {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let key = &segment[..key_end];
    let mut indices = Vec::new();
    let mut rest = &segment[key_end..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            break;
        };
        let inner = stripped[..close].trim().trim_matches(|c| c == '"' || c == '\'');
        if !inner.is_empty() {
            indices.push(inner);
        }
        rest = &stripped[close + 1..];
    }
    (key, indices)
}

/// Formats a JSON value for splicing into text.
///
/// Strings are returned as-is, `null` becomes empty, everything else is JSON.
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}

/// Interprets a resolved option as a flag. The strings `"false"`, `"0"`, `"no"`
/// and `"off"` count as false so environment-driven flags behave.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::String(text) => !matches!(text.trim().to_ascii_lowercase().as_str(), "" | "false" | "0" | "no" | "off"),
        other => is_truthy(other),
    }
}

/// Interprets a resolved option as a number; blank or non-numeric yields `None`.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Interprets a resolved option as a non-negative count.
pub fn coerce_usize(value: &Value) -> Option<usize> {
    coerce_f64(value).filter(|n| n.is_finite() && *n >= 0.0).map(|n| n as usize)
}

/// Interprets a resolved option as text; `null` and blank strings yield `None`.
pub fn coerce_string(value: &Value) -> Option<String> {
    let text = format_json_value(value);
    if text.trim().is_empty() { None } else { Some(text) }
}
