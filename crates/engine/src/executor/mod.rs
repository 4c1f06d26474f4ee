//! Execution engine: drives one workflow through its stages.
//!
//! `Idle → Sources → Filter → Steps → Post → Finalize`
//!
//! - Each declaration runs through [`step_once::execute_declaration`]
//! - A failure records a failed response. With `continueOnError` it is demoted
//!   to a warning and the rest of the stage is abandoned (for steps: the rest
//!   of the current item's steps); otherwise it aborts the run
//! - No new items after the sources means filter, steps and post are skipped

use anyhow::Result;
use tracing::{debug, info, warn};

use pollflow_types::{StepDefinition, StepResponse, WorkflowDefinition};

use crate::action::HandlerRegistry;
use crate::context::{Context, Stage};
use crate::items::item_metadata;
use crate::options::{OptionResolver, ResolvedGeneral, SourceExtraction};

pub mod step_once;
pub mod types;

pub use types::{DeclarationFailure, DeclarationOutcome, ExecutionSummary, FailedCommand, RunPhase};

use step_once::execute_declaration;

/// Stage runner for a single workflow.
pub struct WorkflowExecutor<'a> {
    workflow: &'a WorkflowDefinition,
    registry: &'a HandlerRegistry,
    resolver: OptionResolver<'a>,
    phase: RunPhase,
    /// Extraction options per source index; `None` for skipped or failed sources.
    source_extractions: Vec<Option<SourceExtraction>>,
    summary: ExecutionSummary,
}

impl<'a> WorkflowExecutor<'a> {
    pub fn new(workflow: &'a WorkflowDefinition, registry: &'a HandlerRegistry, general: &'a ResolvedGeneral) -> Self {
        Self {
            workflow,
            registry,
            resolver: OptionResolver::new(general),
            phase: RunPhase::Idle,
            source_extractions: vec![None; workflow.sources.len()],
            summary: ExecutionSummary::default(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Runs every phase. Errors leave `ctx.stage` pointing at the failing stage.
    pub async fn run(&mut self, ctx: &mut Context) -> Result<ExecutionSummary> {
        loop {
            self.phase = match self.phase {
                RunPhase::Idle => RunPhase::Sources,
                RunPhase::Sources => {
                    self.run_sources(ctx).await?;
                    self.summary.aggregated = ctx.public.items.len();
                    if ctx.public.items.is_empty() {
                        info!(workflow = %ctx.public.workflow_relative_path, "no new items");
                        RunPhase::Finalize
                    } else {
                        RunPhase::Filter
                    }
                }
                RunPhase::Filter => {
                    self.run_filter(ctx).await?;
                    self.summary.selected = ctx.public.items.len();
                    RunPhase::Steps
                }
                RunPhase::Steps => {
                    self.run_steps(ctx).await?;
                    RunPhase::Post
                }
                RunPhase::Post => {
                    self.run_post(ctx).await?;
                    RunPhase::Finalize
                }
                RunPhase::Finalize => return Ok(self.summary.clone()),
            };
        }
    }

    async fn run_sources(&mut self, ctx: &mut Context) -> Result<()> {
        for (index, source) in self.workflow.sources.iter().enumerate() {
            match execute_declaration(self.registry, &self.resolver, source, Stage::Source, index, ctx).await {
                Ok(DeclarationOutcome::Completed { resolved, .. }) => {
                    self.source_extractions[index] = resolved.source_extraction().cloned();
                }
                Ok(DeclarationOutcome::Skipped) => {}
                Err(failure) => {
                    handle_failure(ctx, source, Stage::Source, index, failure)?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_filter(&mut self, ctx: &mut Context) -> Result<()> {
        let Some(filter) = &self.workflow.filter else {
            return Ok(());
        };
        let before = ctx.public.items.len();
        match execute_declaration(self.registry, &self.resolver, filter, Stage::Filter, 0, ctx).await {
            Ok(DeclarationOutcome::Completed { .. }) => {
                debug!(before, after = ctx.public.items.len(), "filter applied");
            }
            Ok(DeclarationOutcome::Skipped) => {}
            Err(failure) => handle_failure(ctx, filter, Stage::Filter, 0, failure)?,
        }
        Ok(())
    }

    async fn run_steps(&mut self, ctx: &mut Context) -> Result<()> {
        let items = ctx.public.items.clone();
        for (item_index, item) in items.into_iter().enumerate() {
            let metadata = item_metadata(&item);
            ctx.public.item = item;
            ctx.public.item_index = Some(item_index);
            ctx.public.steps.clear();
            match &metadata {
                Some((key, source_index)) => {
                    ctx.public.item_key = Some(key.clone());
                    ctx.item_source = self.source_extractions.get(*source_index).cloned().flatten();
                }
                None => {
                    warn!(item = item_index, "item carries no key metadata; it will not be remembered");
                    ctx.public.item_key = None;
                    ctx.item_source = None;
                }
            }

            for (step_index, step) in self.workflow.steps.iter().enumerate() {
                if let Err(failure) = execute_declaration(self.registry, &self.resolver, step, Stage::Step, step_index, ctx).await {
                    handle_failure(ctx, step, Stage::Step, step_index, failure)?;
                    break;
                }
            }

            self.summary.processed += 1;
            let forced = ctx.item_source.as_ref().is_some_and(|source| source.force);
            if let Some((key, _)) = metadata
                && !forced
                && !ctx.internal_state.contains(&key)
            {
                ctx.internal_state.remember(&key);
                self.summary.remembered += 1;
            }
        }
        Ok(())
    }

    async fn run_post(&mut self, ctx: &mut Context) -> Result<()> {
        let Some(post) = &self.workflow.post else {
            return Ok(());
        };
        if let Err(failure) = execute_declaration(self.registry, &self.resolver, post, Stage::Post, 0, ctx).await {
            handle_failure(ctx, post, Stage::Post, 0, failure)?;
        }
        Ok(())
    }
}

/// Records the failure and either demotes it (`continueOnError`) or propagates it.
fn handle_failure(ctx: &mut Context, declaration: &StepDefinition, stage: Stage, index: usize, failure: DeclarationFailure) -> Result<()> {
    let DeclarationFailure { id, command, error } = failure;
    let message = format!("{error:#}");
    let mut response = StepResponse::failed(message.clone());
    if let Some(FailedCommand { text, code }) = command {
        response.cmd_result = Some(text);
        response.cmd_code = Some(code);
        response.cmd_ok = Some(false);
    }
    ctx.stage = Some(stage);

    if declaration.continue_on_error {
        warn!(
            workflow = %ctx.public.workflow_relative_path,
            %stage,
            index,
            error = %message,
            "declaration failed; continuing"
        );
        response.ok = true;
        response.is_real_ok = false;
        ctx.public.apply_response(&response);
        ctx.public.record_response(stage, index, id.as_deref(), response);
        return Ok(());
    }

    ctx.public.apply_response(&response);
    ctx.public.record_response(stage, index, id.as_deref(), response);
    Err(error.context(format!("{stage} #{index} failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PublicContext;
    use crate::error::EngineError;
    use pollflow_types::InternalState;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    fn workflow(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).expect("parse workflow")
    }

    fn context() -> Context {
        let mut ctx = Context::new(PublicContext::default());
        ctx.load_state(json!({}), InternalState::default()).unwrap();
        ctx
    }

    /// Registry with a `seen` handler recording every invocation's first argument.
    fn recording_registry() -> (HandlerRegistry, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::with_builtins();
        let sink = seen.clone();
        registry.register_fn("seen", move |args, _ctx| {
            sink.lock().unwrap().push(args.first().cloned().unwrap_or(Value::Null));
            Ok(Value::Null)
        });
        registry.register_fn("fail", |_args, _ctx| anyhow::bail!("boom"));
        (registry, seen)
    }

    async fn run(workflow: &WorkflowDefinition, registry: &HandlerRegistry, ctx: &mut Context) -> Result<ExecutionSummary> {
        let general = ResolvedGeneral {
            enabled: true,
            ..Default::default()
        };
        WorkflowExecutor::new(workflow, registry, &general).run(ctx).await
    }

    #[tokio::test]
    async fn two_sources_aggregate_in_order_and_dedup_on_next_run() {
        let workflow = workflow(
            r#"
sources:
  - id: first
    use: echo
    args: [[{ "id": 1 }, { "id": 2 }]]
    key: id
  - use: echo
    args: [[{ "id": 3 }, { "id": 4 }]]
    key: id
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();

        let summary = run(&workflow, &registry, &mut ctx).await.unwrap();
        assert_eq!(summary.aggregated, 4);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(ctx.internal_state.keys, vec!["4", "3", "2", "1"]);
        assert!(ctx.public.sources.contains_key("first"));
        assert!(ctx.public.sources.contains_key("1"));

        let history = ctx.internal_state.clone();
        let mut second = context();
        second.load_state(json!({}), history).unwrap();
        let summary = run(&workflow, &registry, &mut second).await.unwrap();
        assert_eq!(summary.aggregated, 0);
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn source_continue_on_error_abandons_remaining_sources() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": "a" }]]
    key: id
  - use: fail
    continueOnError: true
  - use: echo
    args: [[{ "id": "never" }]]
    key: id
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        run(&workflow, &registry, &mut ctx).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!("a")]);
        let failed = &ctx.public.sources["1"];
        assert!(failed.ok);
        assert!(!failed.is_real_ok);
        assert!(failed.error.as_deref().unwrap_or_default().contains("boom"));
        assert!(!ctx.public.sources.contains_key("2"));
    }

    #[tokio::test]
    async fn step_continue_on_error_only_breaks_current_item() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }, { "id": 2 }]]
    key: id
steps:
  - use: fail
    if: ${{ ctx.item.id == 1 }}
    continueOnError: true
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        run(&workflow, &registry, &mut ctx).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
        assert_eq!(ctx.internal_state.keys, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn step_failure_without_continue_aborts_the_run() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }, { "id": 2 }]]
    key: id
steps:
  - use: fail
    if: ${{ ctx.item.id == 2 }}
  - use: seen
    args: ${{ ctx.item.id }}
post:
  use: seen
  args: post
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        let error = run(&workflow, &registry, &mut ctx).await.unwrap_err();

        assert!(format!("{error:#}").contains("boom"));
        assert_eq!(ctx.stage, Some(Stage::Step));
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
        // Item 1 completed before the abort and stays remembered.
        assert_eq!(ctx.internal_state.keys, vec!["1"]);
        assert!(!ctx.public.steps["0"].ok);
    }

    #[tokio::test]
    async fn filter_must_return_a_mask_of_matching_length() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }, { "id": 2 }, { "id": 3 }]]
    key: id
filter:
  use: echo
  args: [[true, false]]
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        let error = run(&workflow, &registry, &mut ctx).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidFilterResult { expected: 3, .. })
        ));
        assert!(error.root_cause().to_string().starts_with("Invalid filter step result"));
    }

    #[tokio::test]
    async fn filter_mask_narrows_items() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1, "keep": true }, { "id": 2, "keep": false }, { "id": 3, "keep": true }]]
    key: id
filter:
  run: "cat >/dev/null; echo '[true, false, true]'"
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        let summary = run(&workflow, &registry, &mut ctx).await.unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(3)]);
        assert_eq!(ctx.public.filter.as_ref().map(|filter| filter.ok), Some(true));
        // Filtered-out items are never processed, so they are not remembered.
        assert_eq!(ctx.internal_state.keys, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn empty_sources_skip_remaining_stages() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[]]
filter:
  use: fail
post:
  use: fail
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        let general = ResolvedGeneral::default();
        let mut executor = WorkflowExecutor::new(&workflow, &registry, &general);
        executor.run(&mut ctx).await.unwrap();
        assert_eq!(executor.phase(), RunPhase::Finalize);
    }

    #[tokio::test]
    async fn false_gates_record_neutral_responses() {
        let workflow = workflow(
            r#"
sources:
  - id: gated
    if: false
    use: fail
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
steps:
  - if: ${{ ctx.item.id != 1 }}
    use: fail
post:
  if: false
  use: fail
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        run(&workflow, &registry, &mut ctx).await.unwrap();
        let skipped = &ctx.public.sources["0"];
        assert!(skipped.ok);
        assert_eq!(skipped.result, Value::Null);
        assert!(ctx.public.steps["0"].ok);
        // The gated post is the last declaration seen, not the step before it.
        assert_eq!(ctx.public.options["if"], json!(false));
        assert_eq!(ctx.public.options["stage"], json!("post"));
    }

    #[tokio::test]
    async fn forced_sources_bypass_history() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": "x" }]]
    key: id
    force: true
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        ctx.load_state(json!({}), InternalState { keys: vec!["x".into()] }).unwrap();
        run(&workflow, &registry, &mut ctx).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("x")]);
        assert_eq!(ctx.internal_state.keys, vec!["x"]);
        assert!(ctx.changes().unwrap().internal_state.is_none());
    }

    #[tokio::test]
    async fn assert_and_cmd_shape_the_response() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
steps:
  - id: upper
    use: echo
    args: hello
    cmd: tr a-z A-Z
    assert: ${{ ctx.result == 'HELLO' }}
  - use: echo
    args: ${{ ctx.steps.upper.cmdResult }}
    assert: ctx.result == 'nope'
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        let error = run(&workflow, &registry, &mut ctx).await.unwrap_err();
        assert!(matches!(error.downcast_ref::<EngineError>(), Some(EngineError::AssertionFailed { .. })));
        let upper = &ctx.public.steps["upper"];
        assert_eq!(upper.result, json!("HELLO"));
        assert_eq!(upper.cmd_code, Some(0));
        assert_eq!(upper.cmd_ok, Some(true));
    }

    #[tokio::test]
    async fn post_hook_failure_is_only_a_warning() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
    post:
      use: fail
steps:
  - use: state.merge
    args: { "last": "${{ ctx.item.id }}" }
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        run(&workflow, &registry, &mut ctx).await.unwrap();
        assert!(ctx.public.sources["0"].ok);
        assert_eq!(ctx.public.state, json!({ "last": 1 }));
    }

    #[tokio::test]
    async fn oversized_sleep_fails_the_declaration() {
        let tolerant = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
    sleep: '1e30'
    continueOnError: true
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        let summary = run(&tolerant, &registry, &mut ctx).await.unwrap();
        assert_eq!(summary.aggregated, 0);
        let source = &ctx.public.sources["0"];
        assert!(source.ok);
        assert!(!source.is_real_ok);
        assert!(source.error.as_deref().unwrap_or_default().contains("invalid sleep"));

        let strict = workflow("sources:\n  - use: echo\n    args: [[]]\n    sleep: 'inf'\n");
        let mut ctx = context();
        let error = run(&strict, &registry, &mut ctx).await.unwrap_err();
        assert!(format!("{error:#}").contains("invalid sleep of inf seconds"));
        assert_eq!(ctx.stage, Some(Stage::Source));
    }

    #[tokio::test]
    async fn failed_command_output_stays_recorded() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
steps:
  - id: transform
    use: echo
    args: hello
    cmd: "cat >/dev/null; echo partial; exit 3"
    continueOnError: true
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        run(&workflow, &registry, &mut ctx).await.unwrap();

        let step = &ctx.public.steps["0"];
        assert!(step.ok);
        assert!(!step.is_real_ok);
        assert_eq!(step.cmd_result.as_deref(), Some("partial"));
        assert_eq!(step.cmd_code, Some(3));
        assert_eq!(step.cmd_ok, Some(false));
        assert_eq!(ctx.public.steps["transform"].cmd_code, Some(3));
        assert_eq!(ctx.public.cmd_code, Some(3));
        assert_eq!(ctx.public.cmd_ok, Some(false));
    }

    #[tokio::test]
    async fn failed_source_contributes_no_items() {
        let workflow = workflow(
            r#"
sources:
  - use: echo
    args: [[{ "id": 1 }]]
    key: id
  - use: echo
    args: [[{ "id": 2 }]]
    key: id
    force: true
    sleep: ${{ nope }}
    continueOnError: true
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        let summary = run(&workflow, &registry, &mut ctx).await.unwrap();

        assert_eq!(summary.aggregated, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
        assert_eq!(ctx.internal_state.keys, vec!["1"]);
        assert!(!ctx.public.sources["1"].is_real_ok);
    }

    #[tokio::test]
    async fn alternate_selection_reads_earlier_source_outputs() {
        let workflow = workflow(
            r#"
sources:
  - id: listing
    use: echo
    args: [[{ "id": 1 }, { "id": 2 }]]
    limit: 0
  - id: picks
    use: echo
    args: [[false, true]]
    limit: 0
  - filterFrom: listing
  - use: echo
    args: [[{ "id": 3 }, { "id": 4 }]]
    filterItemsFrom: picks
steps:
  - use: seen
    args: ${{ ctx.item.id }}
"#,
        );
        let (registry, seen) = recording_registry();
        let mut ctx = context();
        let summary = run(&workflow, &registry, &mut ctx).await.unwrap();

        assert_eq!(summary.aggregated, 3);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(4)]);
        assert_eq!(ctx.internal_state.keys.len(), 3);
    }

    #[tokio::test]
    async fn reference_selection_rejects_items_path() {
        let workflow = workflow(
            r#"
sources:
  - id: listing
    use: echo
    args: [[]]
  - filterFrom: listing
    itemsPath: data
"#,
        );
        let (registry, _) = recording_registry();
        let mut ctx = context();
        let error = run(&workflow, &registry, &mut ctx).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::ConflictingExtractionStrategy { option: "itemsPath", .. })
        ));
    }
}
