//! Item extraction and deduplication for source results.

use anyhow::{Result, bail};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use pollflow_types::{ITEM_KEY_FIELD, ITEM_SOURCE_INDEX_FIELD, InternalState, StepResponse};
use pollflow_util::hashing::content_hash;

use crate::error::{EngineError, json_type_name};
use crate::options::{ItemSelection, SourceExtraction};
use crate::resolve::{format_json_value, select_path};

/// Turns a source result into tagged, deduplicated items.
///
/// `sources` holds the responses recorded so far, for `filterFrom` and
/// `filterItemsFrom`. The returned items are not yet appended to `ctx.items`.
pub fn extract_items(
    result: &Value,
    extraction: &SourceExtraction,
    source_index: usize,
    internal_state: &InternalState,
    sources: &IndexMap<String, StepResponse>,
) -> Result<Vec<Value>> {
    let mut items = match extraction.selection() {
        ItemSelection::Path(path) => locate_items(result, path)?,
        ItemSelection::Reference(name) => locate_items(referenced_output(sources, name)?, None)?,
        ItemSelection::Mask(name) => {
            let items = locate_items(result, None)?;
            let mask = validate_mask(referenced_output(sources, name)?, items.len())?;
            apply_mask(items, &mask)
        }
    };

    if extraction.reverse {
        items.reverse();
    }
    if let Some(limit) = extraction.limit {
        items.truncate(limit);
    }

    let mut extracted = Vec::with_capacity(items.len());
    for item in items {
        let key = item_identifier(&item, extraction.key.as_deref());
        if !extraction.force && internal_state.contains(&key) {
            debug!(source = source_index, key = %key, "skipping already processed item");
            continue;
        }
        extracted.push(tag_item(item, &key, source_index));
    }
    Ok(extracted)
}

/// Navigates to the item array. Without a path the whole result must be an array.
pub fn locate_items(result: &Value, items_path: Option<&str>) -> Result<Vec<Value>> {
    let located = select_path(result, items_path).unwrap_or(&Value::Null);
    match located {
        Value::Array(items) => Ok(items.clone()),
        other => Err(EngineError::ItemsNotArray {
            path: items_path.unwrap_or("").to_string(),
            found: json_type_name(other),
        }
        .into()),
    }
}

fn referenced_output<'s>(sources: &'s IndexMap<String, StepResponse>, name: &str) -> Result<&'s Value> {
    sources
        .get(name)
        .map(|response| &response.result)
        .ok_or_else(|| EngineError::UnknownOutputReference { name: name.to_string() }.into())
}

/// Checks that `mask` is an array of exactly `expected` booleans.
pub fn validate_mask(mask: &Value, expected: usize) -> Result<Vec<bool>> {
    let Value::Array(entries) = mask else {
        return Err(EngineError::InvalidFilterResult {
            expected,
            found: json_type_name(mask).to_string(),
        }
        .into());
    };
    if entries.len() != expected {
        return Err(EngineError::InvalidFilterResult {
            expected,
            found: format!("an array of {}", entries.len()),
        }
        .into());
    }
    entries
        .iter()
        .map(|entry| match entry {
            Value::Bool(keep) => Ok(*keep),
            other => bail!(EngineError::InvalidFilterResult {
                expected,
                found: format!("an array containing {}", json_type_name(other)),
            }),
        })
        .collect()
}

/// Keeps the items whose mask entry is `true`.
pub fn apply_mask(items: Vec<Value>, mask: &[bool]) -> Vec<Value> {
    items
        .into_iter()
        .zip(mask.iter().copied())
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect()
}

/// Dedup identifier of an item: the value at `key_path`, or the content hash
/// when the path is unset or yields `null`.
pub fn item_identifier(item: &Value, key_path: Option<&str>) -> String {
    let keyed = key_path.and_then(|path| select_path(item, Some(path))).filter(|value| !value.is_null());
    match keyed {
        Some(value) => format_json_value(value),
        None => content_hash(item),
    }
}

/// Adds the reserved metadata fields to object items. Other items pass unchanged.
pub fn tag_item(item: Value, key: &str, source_index: usize) -> Value {
    match item {
        Value::Object(mut map) => {
            map.insert(ITEM_KEY_FIELD.to_string(), Value::String(key.to_string()));
            map.insert(ITEM_SOURCE_INDEX_FIELD.to_string(), Value::from(source_index));
            Value::Object(map)
        }
        other => {
            warn!(source = source_index, "item is not an object; it cannot carry a key and will not be remembered");
            other
        }
    }
}

/// Reads the reserved metadata back: `(key, source_index)`.
pub fn item_metadata(item: &Value) -> Option<(String, usize)> {
    let key = item.get(ITEM_KEY_FIELD)?.as_str()?.to_string();
    let source_index = usize::try_from(item.get(ITEM_SOURCE_INDEX_FIELD)?.as_u64()?).ok()?;
    Some((key, source_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extraction() -> SourceExtraction {
        SourceExtraction {
            key: Some("id".into()),
            ..Default::default()
        }
    }

    fn extract(result: &Value, extraction: &SourceExtraction, history: &InternalState) -> Result<Vec<Value>> {
        extract_items(result, extraction, 0, history, &IndexMap::new())
    }

    fn recorded(entries: &[(&str, Value)]) -> IndexMap<String, StepResponse> {
        entries
            .iter()
            .map(|(name, result)| {
                let response = StepResponse {
                    result: result.clone(),
                    ..StepResponse::skipped()
                };
                (name.to_string(), response)
            })
            .collect()
    }

    #[test]
    fn navigates_items_path_then_reverses_and_limits() {
        let result = json!({ "data": { "children": [{ "id": 1 }, { "id": 2 }, { "id": 3 }] } });
        let extraction = SourceExtraction {
            items_path: Some("data.children".into()),
            reverse: true,
            limit: Some(2),
            ..extraction()
        };
        let items = extract(&result, &extraction, &InternalState::default()).unwrap();
        let ids: Vec<&Value> = items.iter().map(|item| &item["id"]).collect();
        assert_eq!(ids, vec![&json!(3), &json!(2)]);
        assert_eq!(items[0][ITEM_KEY_FIELD], json!("3"));
        assert_eq!(items[0][ITEM_SOURCE_INDEX_FIELD], json!(0));
    }

    #[test]
    fn rejects_non_array_items() {
        let nested = SourceExtraction {
            items_path: Some("data".into()),
            ..extraction()
        };
        let error = extract(&json!({ "data": { "id": 1 } }), &nested, &InternalState::default()).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::ItemsNotArray { found: "object", .. })
        ));
        assert!(extract(&json!({}), &extraction(), &InternalState::default()).is_err());
    }

    #[test]
    fn skips_known_keys_unless_forced() {
        let result = json!([{ "id": "a" }, { "id": "b" }]);
        let history = InternalState {
            keys: vec!["a".into()],
        };
        let items = extract(&result, &extraction(), &history).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "b");

        let forced = SourceExtraction {
            force: true,
            ..extraction()
        };
        assert_eq!(extract(&result, &forced, &history).unwrap().len(), 2);
    }

    #[test]
    fn duplicates_within_one_result_are_kept() {
        let items = extract(&json!([{ "id": 1 }, { "id": 1 }]), &extraction(), &InternalState::default()).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn identifier_falls_back_to_content_hash() {
        let item = json!({ "title": "x", "id": null });
        assert_eq!(item_identifier(&item, Some("id")), content_hash(&item));
        assert_eq!(item_identifier(&item, None), content_hash(&item));
        assert_eq!(item_identifier(&json!({ "id": 5 }), Some("id")), "5");
        assert_eq!(item_identifier(&json!({ "meta": { "guid": "g" } }), Some("meta.guid")), "g");
    }

    #[test]
    fn non_object_items_are_not_tagged() {
        let items = extract(&json!(["a", 2]), &SourceExtraction::default(), &InternalState::default()).unwrap();
        assert_eq!(items, vec![json!("a"), json!(2)]);
        assert!(item_metadata(&items[0]).is_none());
    }

    #[test]
    fn filter_from_takes_items_from_a_named_output() {
        let sources = recorded(&[("feed", json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }]))]);
        let by_reference = SourceExtraction {
            filter_from: Some("feed".into()),
            reverse: true,
            limit: Some(2),
            ..Default::default()
        };
        // The own result is ignored in favour of the referenced one.
        let items = extract_items(&json!({ "unused": true }), &by_reference, 1, &InternalState::default(), &sources).unwrap();
        let ids: Vec<&Value> = items.iter().map(|item| &item["id"]).collect();
        assert_eq!(ids, vec![&json!(3), &json!(2)]);
        assert_eq!(items[0][ITEM_KEY_FIELD], json!(content_hash(&json!({ "id": 3 }))));
        assert_eq!(items[0][ITEM_SOURCE_INDEX_FIELD], json!(1));

        let missing = SourceExtraction {
            filter_from: Some("nope".into()),
            ..Default::default()
        };
        let error = extract_items(&json!([]), &missing, 1, &InternalState::default(), &sources).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownOutputReference { name }) if name == "nope"
        ));
    }

    #[test]
    fn filter_items_from_masks_the_own_result() {
        let sources = recorded(&[("mask", json!([false, true, true])), ("short", json!([true]))]);
        let result = json!([{ "id": 1 }, { "id": 2 }, { "id": 4 }]);
        let masked = SourceExtraction {
            filter_items_from: Some("mask".into()),
            ..Default::default()
        };
        let items = extract_items(&result, &masked, 0, &InternalState::default(), &sources).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 2);

        let short = SourceExtraction {
            filter_items_from: Some("short".into()),
            ..Default::default()
        };
        let error = extract_items(&result, &short, 0, &InternalState::default(), &sources).unwrap_err();
        assert!(matches!(error.downcast_ref::<EngineError>(), Some(EngineError::InvalidFilterResult { expected: 3, .. })));
    }

    #[test]
    fn metadata_round_trips_through_tagging() {
        let tagged = tag_item(json!({ "id": 1 }), "1", 3);
        assert_eq!(item_metadata(&tagged), Some(("1".to_string(), 3)));
    }
}
