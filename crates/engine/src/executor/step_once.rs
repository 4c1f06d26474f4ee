//! Single declaration execution.
//!
//! resolve → invoke → cmd → assert → record → extract/filter → post hook → sleep

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use pollflow_types::{HookDefinition, StepDefinition, StepResponse};
use pollflow_util::text_processing::redact_json;

use crate::action::{Action, HandlerRegistry, invoke_action, run_cmd};
use crate::context::{Context, PublicContext, Stage};
use crate::error::EngineError;
use crate::items::{apply_mask, extract_items, validate_mask};
use crate::options::{DeclarationKind, OptionResolver};
use crate::resolve::{coerce_string, eval_condition, interpolate_value};

use super::types::{DeclarationFailure, DeclarationOutcome, FailedCommand};

/// What a declaration got far enough to produce before failing.
#[derive(Debug, Default)]
struct Progress {
    id: Option<String>,
    command: Option<FailedCommand>,
}

/// Executes `declaration` as entry `index` of `stage`.
///
/// A failed source contributes no items, even when extraction had already run.
pub(crate) async fn execute_declaration(
    registry: &HandlerRegistry,
    resolver: &OptionResolver<'_>,
    declaration: &StepDefinition,
    stage: Stage,
    index: usize,
    ctx: &mut Context,
) -> Result<DeclarationOutcome, DeclarationFailure> {
    let aggregated = ctx.public.items.len();
    let mut progress = Progress::default();
    match run_declaration(registry, resolver, declaration, stage, index, ctx, &mut progress).await {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            if stage == Stage::Source {
                ctx.public.items.truncate(aggregated);
            }
            Err(DeclarationFailure {
                id: progress.id,
                command: progress.command,
                error,
            })
        }
    }
}

async fn run_declaration(
    registry: &HandlerRegistry,
    resolver: &OptionResolver<'_>,
    declaration: &StepDefinition,
    stage: Stage,
    index: usize,
    ctx: &mut Context,
    progress: &mut Progress,
) -> Result<DeclarationOutcome> {
    ctx.stage = Some(stage);

    let Some(mut resolved) = resolver.resolve(declaration, stage, &mut ctx.public)? else {
        debug!(%stage, index, "condition is false; skipping");
        if matches!(stage, Stage::Source | Stage::Step) {
            let response = StepResponse::skipped();
            ctx.public.apply_response(&response);
            ctx.public.record_response(stage, index, None, response);
        }
        return Ok(DeclarationOutcome::Skipped);
    };
    progress.id.clone_from(&resolved.options.id);

    if resolved.options.debug {
        info!(%stage, index, options = %redact_json(&ctx.public.options), "resolved options");
    }

    let action = Action::select(
        resolved.options.from.as_deref(),
        resolved.options.uses.as_deref(),
        resolved.options.run.as_deref(),
    );
    let result = invoke_action(registry, &action, resolved.options.args.clone(), &mut ctx.public).await?;
    let mut response = StepResponse {
        result,
        ok: true,
        is_real_ok: true,
        ..Default::default()
    };
    ctx.public.apply_response(&response);

    if let Some(cmd) = resolved.options.cmd.as_deref() {
        let outcome = match run_cmd(cmd, &response.result, &mut ctx.public).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let (Some(text), Some(code)) = (ctx.public.cmd_result.clone(), ctx.public.cmd_code) {
                    progress.command = Some(FailedCommand { text, code });
                }
                return Err(error);
            }
        };
        response.result = outcome.result;
        response.ok = outcome.ok;
        response.is_real_ok = outcome.ok;
        response.cmd_result = Some(outcome.text);
        response.cmd_code = Some(outcome.code);
        response.cmd_ok = Some(outcome.ok);
        ctx.public.apply_response(&response);
    }

    if let Some(expression) = declaration.assert.as_deref() {
        let scope = ctx.public.scope()?;
        if !eval_condition(expression, &scope)? {
            return Err(EngineError::AssertionFailed {
                expression: expression.to_string(),
            }
            .into());
        }
    }

    ctx.public.record_response(stage, index, progress.id.as_deref(), response.clone());

    match &resolved.kind {
        DeclarationKind::Source(extraction) => {
            let items = extract_items(&response.result, extraction, index, &ctx.internal_state, &ctx.public.sources)?;
            debug!(source = index, count = items.len(), "extracted items");
            ctx.public.items.extend(items);
        }
        DeclarationKind::Filter => {
            let mask = validate_mask(&response.result, ctx.public.items.len())?;
            let items = std::mem::take(&mut ctx.public.items);
            ctx.public.items = apply_mask(items, &mask);
        }
        DeclarationKind::Step | DeclarationKind::Post => {}
    }

    if let Some(hook) = &declaration.post
        && let Err(error) = run_hook(registry, hook, &mut ctx.public).await
    {
        warn!(%stage, index, error = %format!("{error:#}"), "post hook failed");
    }

    let scope = ctx.public.scope()?;
    resolved.options.sleep = resolver.resolve_sleep(declaration, &scope)?;
    if let Some(seconds) = resolved.options.sleep.filter(|seconds| *seconds > 0.0) {
        let duration = Duration::try_from_secs_f64(seconds).with_context(|| format!("invalid sleep of {seconds} seconds"))?;
        debug!(%stage, index, seconds, "sleeping");
        tokio::time::sleep(duration).await;
    }

    Ok(DeclarationOutcome::Completed {
        resolved: Box::new(resolved),
        response,
    })
}

/// Resolves and runs a `post` hook. The result is discarded.
async fn run_hook(registry: &HandlerRegistry, hook: &HookDefinition, ctx: &mut PublicContext) -> Result<()> {
    let scope = ctx.scope()?;
    let resolve = |raw: Option<&Value>| -> Result<Option<Value>> {
        raw.map(|value| interpolate_value(value, &scope)).transpose().context("failed to resolve post hook")
    };
    let from = resolve(hook.from.as_ref())?.and_then(|value| coerce_string(&value));
    let uses = resolve(hook.r#use.as_ref())?.and_then(|value| coerce_string(&value));
    let run = resolve(hook.run.as_ref())?.and_then(|value| coerce_string(&value));
    let args = match resolve(hook.args.as_ref())? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values,
        Some(single) => vec![single],
    };

    let action = Action::select(from.as_deref(), uses.as_deref(), run.as_deref());
    invoke_action(registry, &action, args, ctx).await?;
    Ok(())
}
