//! Batch coordinator: discovers workflows and runs them one after another.
//!
//! Each workflow gets a fresh [`Context`], its general options resolved, its
//! store opened, and its stages executed. Persisted keys are written back only
//! when their serialized form changed, whether or not the stages succeeded.
//! A failing workflow never stops the batch.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use pollflow_types::InternalState;
use pollflow_util::kv_store::{INTERNAL_STATE_KEY, KeyValueStore, STATE_KEY, StoreProvider};
use pollflow_util::path_processing::namespace_for;

use crate::action::HandlerRegistry;
use crate::context::{Context, PublicContext};
use crate::error::BatchRunError;
use crate::executor::WorkflowExecutor;
use crate::options::{InvocationDefaults, resolve_general};

use super::document::{WorkflowSource, discover_workflows};
use super::state::{BatchSummary, FailurePoint, PersistedKeys, WorkflowOutcome, WorkflowStatus};

/// Merged invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Glob patterns relative to `cwd`.
    pub patterns: Vec<String>,
    /// Inline workflow document; exclusive with `patterns`.
    pub content: Option<String>,
    pub cwd: PathBuf,
    /// Seed for `ctx.env`.
    pub env: IndexMap<String, Value>,
    pub debug: bool,
    pub limit: Option<usize>,
    pub force: bool,
    pub sleep: Option<f64>,
    /// Storage descriptor used when a workflow does not name its own `database`.
    pub database: Option<String>,
}

impl RunOptions {
    pub fn defaults(&self) -> InvocationDefaults {
        InvocationDefaults {
            debug: self.debug,
            sleep: self.sleep,
            limit: self.limit,
            force: self.force,
        }
    }
}

/// Runs every discovered workflow sequentially.
///
/// Discovery errors are returned directly. Workflow failures are logged and
/// collected; if any occurred the result is a [`BatchRunError`].
pub async fn run_batch(options: &RunOptions, registry: &HandlerRegistry, stores: &dyn StoreProvider) -> Result<BatchSummary> {
    let sources = discover_workflows(&options.patterns, options.content.as_deref(), &options.cwd)?;
    if sources.is_empty() {
        warn!(patterns = ?options.patterns, "no workflow files matched");
    }

    let mut summary = BatchSummary::default();
    for source in &sources {
        let outcome = run_workflow(options, registry, stores, source).await;
        summary.workflows.push(outcome);
    }

    let failed: Vec<String> = summary.failures().map(|outcome| outcome.relative_path.clone()).collect();
    if !failed.is_empty() {
        return Err(BatchRunError {
            failed: failed.len(),
            total: summary.workflows.len(),
            workflows: failed,
        }
        .into());
    }
    Ok(summary)
}

/// Runs one workflow and converts any failure into a recorded outcome.
pub async fn run_workflow(options: &RunOptions, registry: &HandlerRegistry, stores: &dyn StoreProvider, source: &WorkflowSource) -> WorkflowOutcome {
    let mut outcome = WorkflowOutcome::new(&source.relative_path, WorkflowStatus::Completed);
    info!(workflow = %source.relative_path, "running workflow");

    if let Err((point, failure)) = drive_workflow(options, registry, stores, source, &mut outcome).await {
        let message = format!("{failure:#}");
        error!(workflow = %source.relative_path, stage = %point, error = %message, "workflow failed");
        outcome.status = WorkflowStatus::Failed;
        outcome.failed_at = Some(point);
        outcome.error = Some(message);
    } else if outcome.status == WorkflowStatus::Completed {
        info!(
            workflow = %source.relative_path,
            items = outcome.summary.aggregated,
            processed = outcome.summary.processed,
            "workflow completed"
        );
    }
    outcome
}

async fn drive_workflow(
    options: &RunOptions,
    registry: &HandlerRegistry,
    stores: &dyn StoreProvider,
    source: &WorkflowSource,
    outcome: &mut WorkflowOutcome,
) -> Result<(), (FailurePoint, anyhow::Error)> {
    let workflow = source.load().map_err(|error| (FailurePoint::Load, error))?;

    let mut ctx = Context::new(public_context(options, source));
    let general = resolve_general(&workflow.general, &options.defaults(), &mut ctx.public)
        .context("failed to resolve workflow options")
        .map_err(|error| (FailurePoint::Options, error))?;
    if !general.enabled {
        info!(workflow = %source.relative_path, "workflow condition is false; skipping");
        outcome.status = WorkflowStatus::Skipped;
        return Ok(());
    }

    let store = open_store(options, stores, source, general.database.as_deref(), &mut ctx).map_err(|error| (FailurePoint::Storage, error))?;

    let run_result = WorkflowExecutor::new(&workflow, registry, &general).run(&mut ctx).await;
    let persisted = persist(store.as_ref(), &ctx);

    match run_result {
        Ok(summary) => outcome.summary = summary,
        Err(error) => {
            if let Err(persist_error) = &persisted {
                warn!(workflow = %source.relative_path, error = %format!("{persist_error:#}"), "failed to persist state");
            }
            let point = ctx.stage.map(FailurePoint::Stage).unwrap_or(FailurePoint::Load);
            return Err((point, error));
        }
    }
    outcome.persisted = persisted.map_err(|error| (FailurePoint::Persist, error))?;
    Ok(())
}

fn public_context(options: &RunOptions, source: &WorkflowSource) -> PublicContext {
    PublicContext {
        env: options.env.clone(),
        workflow_path: source.path.to_string_lossy().to_string(),
        workflow_relative_path: source.relative_path.clone(),
        workflow_cwd: source.directory().to_string_lossy().to_string(),
        state: json!({}),
        ..Default::default()
    }
}

/// Opens the workflow's store and loads both persisted keys into `ctx`.
fn open_store(
    options: &RunOptions,
    stores: &dyn StoreProvider,
    source: &WorkflowSource,
    database: Option<&str>,
    ctx: &mut Context,
) -> Result<Box<dyn KeyValueStore>> {
    let namespace = namespace_for(&source.relative_path);
    let descriptor = database.or(options.database.as_deref());
    let store = stores
        .open(&namespace, descriptor)
        .with_context(|| format!("failed to open store for namespace '{namespace}'"))?;

    let state = store.get(STATE_KEY).context("failed to load state")?.unwrap_or_else(|| json!({}));
    let internal_state = match store.get(INTERNAL_STATE_KEY).context("failed to load internal state")? {
        Some(raw) => serde_json::from_value::<InternalState>(raw).unwrap_or_else(|error| {
            warn!(workflow = %source.relative_path, error = %error, "stored internal state is malformed; starting with empty history");
            InternalState::default()
        }),
        None => InternalState::default(),
    };
    ctx.load_state(state, internal_state)?;
    Ok(store)
}

/// Writes back the keys whose serialized form changed since load.
fn persist(store: &dyn KeyValueStore, ctx: &Context) -> Result<PersistedKeys> {
    let changes = ctx.changes()?;
    let mut persisted = PersistedKeys::default();
    if let Some(state) = changes.state {
        store.set(STATE_KEY, state).context("failed to save state")?;
        persisted.state = true;
    }
    if let Some(internal_state) = changes.internal_state {
        store.set(INTERNAL_STATE_KEY, internal_state).context("failed to save internal state")?;
        persisted.internal_state = true;
    }
    Ok(persisted)
}
