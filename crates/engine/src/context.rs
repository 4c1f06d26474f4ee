//! Execution context of a single workflow run.
//!
//! [`PublicContext`] is what templates see as `ctx` and what `run` scripts
//! receive on stdin. [`Context`] wraps it together with engine-owned state that
//! is never exposed: the dedup history, the load snapshots used for the
//! persistence decision, and the current stage.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use pollflow_types::{InternalState, StepResponse};

use crate::options::SourceExtraction;
use crate::resolve::format_json_value;

/// The stage currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Source,
    Filter,
    Step,
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Source => "source",
            Stage::Filter => "filter",
            Stage::Step => "step",
            Stage::Post => "post",
        };
        formatter.write_str(label)
    }
}

/// Context fields visible to templates, handlers and scripts.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicContext {
    pub env: IndexMap<String, Value>,
    /// Absolute path of the workflow file.
    pub workflow_path: String,
    pub workflow_relative_path: String,
    /// Directory containing the workflow file.
    pub workflow_cwd: String,
    /// User-visible persisted state.
    pub state: Value,
    /// Items aggregated by the source stage (narrowed by the filter).
    pub items: Vec<Value>,
    pub item: Value,
    pub item_index: Option<usize>,
    pub item_key: Option<String>,
    /// Source responses keyed by index and id.
    pub sources: IndexMap<String, StepResponse>,
    /// Step responses of the current item keyed by index and id.
    pub steps: IndexMap<String, StepResponse>,
    pub filter: Option<StepResponse>,
    pub result: Value,
    pub ok: bool,
    pub is_real_ok: bool,
    pub error: Option<String>,
    pub cmd_result: Option<String>,
    pub cmd_code: Option<i32>,
    pub cmd_ok: Option<bool>,
    /// Resolved options of the declaration currently running.
    pub options: Value,
}

impl PublicContext {
    /// Serializes the context into the scope templates are evaluated against.
    pub fn scope(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize workflow context")
    }

    /// Environment passed to shell commands; values are rendered as text.
    pub fn shell_env(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), format_json_value(value)))
            .collect()
    }

    /// Copies a declaration outcome into the top-level result fields.
    pub fn apply_response(&mut self, response: &StepResponse) {
        self.result = response.result.clone();
        self.ok = response.ok;
        self.is_real_ok = response.is_real_ok;
        self.error = response.error.clone();
        self.cmd_result = response.cmd_result.clone();
        self.cmd_code = response.cmd_code;
        self.cmd_ok = response.cmd_ok;
    }

    /// Records `response` for `stage` under the index and, when present, the id.
    pub fn record_response(&mut self, stage: Stage, index: usize, id: Option<&str>, response: StepResponse) {
        let target = match stage {
            Stage::Source => &mut self.sources,
            Stage::Step => &mut self.steps,
            Stage::Filter => {
                self.filter = Some(response);
                return;
            }
            Stage::Post => return,
        };
        if let Some(id) = id {
            target.insert(id.to_string(), response.clone());
        }
        target.insert(index.to_string(), response);
    }
}

/// Full per-run context.
#[derive(Debug, Clone)]
pub struct Context {
    pub public: PublicContext,
    pub internal_state: InternalState,
    /// Extraction options of the source that produced the current item.
    pub item_source: Option<SourceExtraction>,
    pub stage: Option<Stage>,
    state_snapshot: String,
    internal_snapshot: String,
}

impl Context {
    pub fn new(public: PublicContext) -> Self {
        Self {
            public,
            internal_state: InternalState::default(),
            item_source: None,
            stage: None,
            state_snapshot: String::new(),
            internal_snapshot: String::new(),
        }
    }

    /// Installs loaded state and records the snapshots used by [`Context::changes`].
    pub fn load_state(&mut self, state: Value, internal_state: InternalState) -> Result<()> {
        self.public.state = state;
        self.internal_state = internal_state;
        self.state_snapshot = serde_json::to_string(&self.public.state)?;
        self.internal_snapshot = serde_json::to_string(&self.internal_state)?;
        Ok(())
    }

    /// Returns the serialized values whose form differs from the load snapshot.
    pub fn changes(&self) -> Result<StateChanges> {
        let state = serde_json::to_value(&self.public.state)?;
        let internal_state = serde_json::to_value(&self.internal_state)?;
        Ok(StateChanges {
            state: (serde_json::to_string(&state)? != self.state_snapshot).then_some(state),
            internal_state: (serde_json::to_string(&internal_state)? != self.internal_snapshot).then_some(internal_state),
        })
    }
}

/// Values that must be written back to storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateChanges {
    pub state: Option<Value>,
    pub internal_state: Option<Value>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.internal_state.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_uses_camel_case_keys() {
        let mut public = PublicContext {
            workflow_relative_path: "workflows/a.yml".into(),
            item_index: Some(2),
            ..Default::default()
        };
        public.record_response(
            Stage::Source,
            0,
            Some("feed"),
            StepResponse {
                result: json!([1]),
                ok: true,
                is_real_ok: true,
                ..Default::default()
            },
        );
        let scope = public.scope().unwrap();
        assert_eq!(scope["workflowRelativePath"], "workflows/a.yml");
        assert_eq!(scope["itemIndex"], 2);
        assert_eq!(scope["sources"]["0"]["result"], json!([1]));
        assert_eq!(scope["sources"]["feed"]["isRealOk"], true);
    }

    #[test]
    fn filter_and_post_responses_are_not_indexed() {
        let mut public = PublicContext::default();
        public.record_response(Stage::Filter, 0, Some("f"), StepResponse::skipped());
        public.record_response(Stage::Post, 0, Some("p"), StepResponse::skipped());
        assert!(public.filter.is_some());
        assert!(public.sources.is_empty() && public.steps.is_empty());
    }

    #[test]
    fn changes_compare_against_load_snapshot() {
        let mut context = Context::new(PublicContext::default());
        context.load_state(json!({ "cursor": 1 }), InternalState::default()).unwrap();
        assert!(context.changes().unwrap().is_empty());

        context.public.state = json!({ "cursor": 2 });
        let changes = context.changes().unwrap();
        assert_eq!(changes.state, Some(json!({ "cursor": 2 })));
        assert!(changes.internal_state.is_none());

        context.internal_state.remember("k");
        assert!(context.changes().unwrap().internal_state.is_some());
    }

    #[test]
    fn shell_env_renders_values_as_text() {
        let mut public = PublicContext::default();
        public.env.insert("COUNT".into(), json!(3));
        public.env.insert("NAME".into(), json!("feed"));
        let env = public.shell_env();
        assert_eq!(env["COUNT"], "3");
        assert_eq!(env["NAME"], "feed");
    }
}
