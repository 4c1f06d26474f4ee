//! Strongly typed workflow schema definitions shared by the engine and the CLI.
//!
//! Every option value is kept as raw JSON because any of them may carry a
//! `${{ ... }}` template that is only resolvable at run time. The engine turns
//! these raw declarations into resolved options pass by pass.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Reserved item field holding the dedup identifier injected by the engine.
pub const ITEM_KEY_FIELD: &str = "@pollflowKey";
/// Reserved item field holding the index of the source that produced the item.
pub const ITEM_SOURCE_INDEX_FIELD: &str = "@pollflowSourceIndex";
/// Upper bound of the persisted dedup history.
pub const MAX_HISTORY_KEYS: usize = 1000;

/// A complete workflow document: general options plus the four stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow-wide options (`env`, `if`, `debug`, `database`, `sleep`, `limit`, `force`).
    #[serde(flatten)]
    pub general: GeneralOptions,
    /// Ordered data sources; items are aggregated in this order.
    #[serde(default)]
    pub sources: Vec<StepDefinition>,
    /// Optional filter applied once to the aggregated items.
    #[serde(default)]
    pub filter: Option<StepDefinition>,
    /// Steps executed in order for every item.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Optional stage executed once after all items were processed.
    #[serde(default)]
    pub post: Option<StepDefinition>,
}

/// Workflow-level options. They also act as defaults for every declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneralOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<IndexMap<String, JsonValue>>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub r#if: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<JsonValue>,
    /// Storage connection descriptor, for example `sqlite://data/state.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<JsonValue>,
    /// Seconds to pause after each declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<JsonValue>,
}

/// A source, filter, step, or post declaration.
///
/// The source-only keys (`force`, `itemsPath`, `key`, `limit`, `reverse`,
/// `filterFrom`, `filterItemsFrom`) are ignored for the other stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Handle under which the response is also recorded (besides the index).
    #[serde(default)]
    pub id: Option<JsonValue>,
    /// Variables merged into the run environment before anything else resolves.
    #[serde(default)]
    pub env: Option<IndexMap<String, JsonValue>>,
    /// Gate; when it resolves falsy the declaration is a neutral no-op.
    #[serde(default, rename = "if")]
    pub r#if: Option<JsonValue>,
    #[serde(default)]
    pub debug: Option<JsonValue>,
    /// Handler namespace, combined with `use` as `from.use`.
    #[serde(default)]
    pub from: Option<JsonValue>,
    /// Handler name in the registry.
    #[serde(default, rename = "use")]
    pub r#use: Option<JsonValue>,
    /// Inline script executed when no handler is named.
    #[serde(default)]
    pub run: Option<JsonValue>,
    /// Handler arguments; a single non-array value is passed as one argument.
    #[serde(default)]
    pub args: Option<JsonValue>,
    /// Shell command receiving the result on stdin.
    #[serde(default)]
    pub cmd: Option<JsonValue>,
    /// Expression that must be truthy once the action finished.
    #[serde(default)]
    pub assert: Option<String>,
    /// Secondary hook run after the assertion.
    #[serde(default)]
    pub post: Option<HookDefinition>,
    #[serde(default)]
    pub sleep: Option<JsonValue>,
    /// Demote a failure to a warning and abandon the rest of the stage.
    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub force: Option<JsonValue>,
    /// Dot path to the item array inside the result.
    #[serde(default)]
    pub items_path: Option<JsonValue>,
    /// Dot path inside each item producing its dedup identifier.
    #[serde(default)]
    pub key: Option<JsonValue>,
    #[serde(default)]
    pub limit: Option<JsonValue>,
    #[serde(default)]
    pub reverse: Option<JsonValue>,
    /// Id or index of an earlier source whose array result supplies the items.
    #[serde(default)]
    pub filter_from: Option<JsonValue>,
    /// Id or index of an earlier source whose result masks this source's array.
    #[serde(default)]
    pub filter_items_from: Option<JsonValue>,
}

/// The `post` hook attached to a declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HookDefinition {
    #[serde(default)]
    pub from: Option<JsonValue>,
    #[serde(default, rename = "use")]
    pub r#use: Option<JsonValue>,
    #[serde(default)]
    pub run: Option<JsonValue>,
    #[serde(default)]
    pub args: Option<JsonValue>,
}

/// Outcome recorded for a single declaration under its index and id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub result: JsonValue,
    pub ok: bool,
    /// `false` when `ok` was forced by `continueOnError`.
    pub is_real_ok: bool,
    pub error: Option<String>,
    pub cmd_result: Option<String>,
    pub cmd_code: Option<i32>,
    pub cmd_ok: Option<bool>,
}

impl StepResponse {
    /// Response of a declaration whose gate was false.
    pub fn skipped() -> Self {
        Self {
            ok: true,
            is_real_ok: true,
            ..Default::default()
        }
    }

    /// Response of a declaration that failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            is_real_ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Engine-owned persisted state: the bounded dedup history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalState {
    /// Previously processed item identifiers, most recent first.
    #[serde(default)]
    pub keys: Vec<String>,
}

impl InternalState {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|existing| existing == key)
    }

    /// Records `key` as most recent unless it is already known, keeping at most
    /// [`MAX_HISTORY_KEYS`] entries.
    pub fn remember(&mut self, key: &str) {
        if !self.contains(key) {
            self.keys.insert(0, key.to_string());
        }
        self.keys.truncate(MAX_HISTORY_KEYS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_workflow_document() {
        let document = r#"
env:
  FEED: https://example.com/feed.json
sleep: 1
sources:
  - id: feed
    use: http.get
    args:
      - ${{ env.FEED }}
    itemsPath: data.items
    key: id
    limit: 5
    continueOnError: true
filter:
  run: echo '[true]'
steps:
  - use: echo
    args: ${{ ctx.item.title }}
    post:
      use: echo
post:
  cmd: cat
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(document).expect("parse workflow");

        assert_eq!(workflow.sources.len(), 1);
        let source = &workflow.sources[0];
        assert!(source.continue_on_error);
        assert_eq!(source.items_path, Some(JsonValue::String("data.items".into())));
        assert_eq!(source.r#use, Some(JsonValue::String("http.get".into())));
        assert_eq!(workflow.general.sleep, Some(JsonValue::from(1)));
        assert!(workflow.general.env.as_ref().is_some_and(|env| env.contains_key("FEED")));
        assert!(workflow.filter.is_some());
        assert!(workflow.steps[0].post.is_some());
        assert!(workflow.post.as_ref().is_some_and(|post| post.cmd.is_some()));
    }

    #[test]
    fn remember_keeps_most_recent_first_and_bounded() {
        let mut state = InternalState::default();
        for index in 0..(MAX_HISTORY_KEYS + 5) {
            state.remember(&index.to_string());
        }
        assert_eq!(state.keys.len(), MAX_HISTORY_KEYS);
        assert_eq!(state.keys[0], (MAX_HISTORY_KEYS + 4).to_string());

        state.remember("1004");
        assert_eq!(state.keys[0], "1004");
        assert_eq!(state.keys.len(), MAX_HISTORY_KEYS);
    }

    #[test]
    fn known_key_is_not_moved() {
        let mut state = InternalState {
            keys: vec!["b".into(), "a".into()],
        };
        state.remember("a");
        assert_eq!(state.keys, vec!["b".to_string(), "a".to_string()]);
    }
}
