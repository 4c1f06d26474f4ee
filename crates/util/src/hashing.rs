//! Stable content hashing for JSON values.
//!
//! Object keys are sorted before hashing so that two items with the same
//! content always produce the same identifier regardless of key order.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Serializes a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => Value::String(text.clone()).to_string(),
        Value::Array(values) => {
            let items: Vec<String> = values.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map.iter().map(|(key, nested)| (key, to_canonical_json(nested))).collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(key, nested)| format!("{}:{}", Value::String(key.clone()), nested))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn content_hash(value: &Value) -> String {
    sha256_hex(&to_canonical_json(value))
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({ "z": [ { "y": "yes" }, null ], "a": { "x": 10 } });
        assert_eq!(to_canonical_json(&value), "{\"a\":{\"x\":10},\"z\":[{\"y\":\"yes\"},null]}");
    }

    #[test]
    fn hash_ignores_key_order() {
        let left = json!({ "id": 1, "title": "hello" });
        let right = json!({ "title": "hello", "id": 1 });
        assert_eq!(content_hash(&left), content_hash(&right));
        assert_ne!(content_hash(&left), content_hash(&json!({ "id": 2, "title": "hello" })));
        assert_eq!(content_hash(&left).len(), 64);
    }
}
