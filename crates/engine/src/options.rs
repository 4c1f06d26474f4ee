//! Option resolution cascade.
//!
//! Declarations are resolved in ordered passes against the live context:
//!
//! 1. `env`, merged into `ctx.env` (never into the process environment)
//! 2. `if` and `debug`; a false `if` stops resolution
//! 3. `id`, `from`, `use`, `run`, `args`
//! 4. sources only: `force`, `itemsPath`, `key`, `limit`, `reverse`
//! 5. sources only: `filterFrom`, `filterItemsFrom`, which exclude `itemsPath` and `key`
//! 6. `cmd`
//! 7. `sleep`, resolved by the executor once the action has run
//!
//! `debug`, `sleep`, `limit` and `force` fall back to the workflow's general
//! options and then to the invocation defaults.

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use pollflow_types::{GeneralOptions, StepDefinition};

use crate::context::{PublicContext, Stage};
use crate::error::EngineError;
use crate::resolve::{coerce_bool, coerce_f64, coerce_string, coerce_usize, interpolate_value};

/// Defaults supplied by the invocation (CLI flags or embedding program).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationDefaults {
    pub debug: bool,
    pub sleep: Option<f64>,
    pub limit: Option<usize>,
    pub force: bool,
}

/// Workflow general options after resolution, merged over the invocation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedGeneral {
    #[serde(rename = "if")]
    pub enabled: bool,
    pub debug: bool,
    pub database: Option<String>,
    pub sleep: Option<f64>,
    pub limit: Option<usize>,
    pub force: bool,
}

/// Options shared by every declaration kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOptions {
    #[serde(rename = "if")]
    pub enabled: bool,
    pub debug: bool,
    pub id: Option<String>,
    pub from: Option<String>,
    #[serde(rename = "use")]
    pub uses: Option<String>,
    pub run: Option<String>,
    pub args: Vec<Value>,
    pub cmd: Option<String>,
    pub sleep: Option<f64>,
    pub continue_on_error: bool,
}

/// Extraction settings of a source declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceExtraction {
    pub force: bool,
    pub items_path: Option<String>,
    pub key: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
    pub filter_from: Option<String>,
    pub filter_items_from: Option<String>,
}

/// How a source turns its result into candidate items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSelection<'a> {
    /// The array at `itemsPath`, or the whole result when unset.
    Path(Option<&'a str>),
    /// `filterFrom`: the array result of the named source output.
    Reference(&'a str),
    /// `filterItemsFrom`: the own result array, masked by the named source output.
    Mask(&'a str),
}

impl SourceExtraction {
    pub fn selection(&self) -> ItemSelection<'_> {
        match (&self.filter_from, &self.filter_items_from) {
            (Some(name), _) => ItemSelection::Reference(name),
            (None, Some(name)) => ItemSelection::Mask(name),
            (None, None) => ItemSelection::Path(self.items_path.as_deref()),
        }
    }
}

/// Kind-specific part of a resolved declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum DeclarationKind {
    Source(SourceExtraction),
    Filter,
    Step,
    Post,
}

impl DeclarationKind {
    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Source => DeclarationKind::Source(SourceExtraction::default()),
            Stage::Filter => DeclarationKind::Filter,
            Stage::Step => DeclarationKind::Step,
            Stage::Post => DeclarationKind::Post,
        }
    }
}

/// A declaration after passes 1 to 6.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDeclaration {
    #[serde(flatten)]
    pub options: ResolvedOptions,
    #[serde(flatten)]
    pub kind: DeclarationKind,
}

impl ResolvedDeclaration {
    pub fn source_extraction(&self) -> Option<&SourceExtraction> {
        match &self.kind {
            DeclarationKind::Source(extraction) => Some(extraction),
            _ => None,
        }
    }
}

/// Individual resolution passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPass {
    Env,
    Gate,
    Action,
    Extraction,
    Selection,
    Command,
    Sleep,
}

impl ResolutionPass {
    /// Passes run before the action, in order.
    pub const BEFORE_ACTION: [ResolutionPass; 6] = [
        ResolutionPass::Env,
        ResolutionPass::Gate,
        ResolutionPass::Action,
        ResolutionPass::Extraction,
        ResolutionPass::Selection,
        ResolutionPass::Command,
    ];
}

/// Resolves declarations against the live context.
#[derive(Debug, Clone)]
pub struct OptionResolver<'a> {
    general: &'a ResolvedGeneral,
}

impl<'a> OptionResolver<'a> {
    pub fn new(general: &'a ResolvedGeneral) -> Self {
        Self { general }
    }

    /// Runs passes 1 to 6. Returns `None` when the `if` gate is false.
    ///
    /// The resolved options are exposed as `ctx.options` once resolution completes,
    /// or as soon as the gate turns out false.
    pub fn resolve(&self, declaration: &StepDefinition, stage: Stage, ctx: &mut PublicContext) -> Result<Option<ResolvedDeclaration>> {
        let mut resolved = ResolvedDeclaration {
            options: ResolvedOptions {
                enabled: true,
                debug: self.general.debug,
                sleep: self.general.sleep,
                continue_on_error: declaration.continue_on_error,
                ..Default::default()
            },
            kind: DeclarationKind::for_stage(stage),
        };

        for pass in ResolutionPass::BEFORE_ACTION {
            self.resolve_pass(declaration, pass, ctx, &mut resolved)?;
            if pass == ResolutionPass::Gate && !resolved.options.enabled {
                ctx.options = serde_json::to_value(&resolved)?;
                return Ok(None);
            }
        }

        ctx.options = serde_json::to_value(&resolved)?;
        Ok(Some(resolved))
    }

    /// Applies a single pass to `resolved`.
    pub fn resolve_pass(
        &self,
        declaration: &StepDefinition,
        pass: ResolutionPass,
        ctx: &mut PublicContext,
        resolved: &mut ResolvedDeclaration,
    ) -> Result<()> {
        if pass == ResolutionPass::Env {
            return merge_env(declaration.env.as_ref(), ctx);
        }

        let scope = ctx.scope()?;
        let options = &mut resolved.options;
        match pass {
            ResolutionPass::Env => {}
            ResolutionPass::Gate => {
                if let Some(gate) = resolve_field(declaration.r#if.as_ref(), "if", &scope)? {
                    options.enabled = coerce_bool(&gate);
                }
                if let Some(debug) = resolve_field(declaration.debug.as_ref(), "debug", &scope)? {
                    options.debug = coerce_bool(&debug);
                }
            }
            ResolutionPass::Action => {
                options.id = resolve_text(declaration.id.as_ref(), "id", &scope)?;
                options.from = resolve_text(declaration.from.as_ref(), "from", &scope)?;
                options.uses = resolve_text(declaration.r#use.as_ref(), "use", &scope)?;
                options.run = resolve_text(declaration.run.as_ref(), "run", &scope)?;
                options.args = match resolve_field(declaration.args.as_ref(), "args", &scope)? {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(values)) => values,
                    Some(single) => vec![single],
                };
            }
            ResolutionPass::Extraction => {
                let DeclarationKind::Source(extraction) = &mut resolved.kind else {
                    return Ok(());
                };
                extraction.force = match resolve_field(declaration.force.as_ref(), "force", &scope)? {
                    Some(force) => coerce_bool(&force),
                    None => self.general.force,
                };
                extraction.items_path = resolve_text(declaration.items_path.as_ref(), "itemsPath", &scope)?;
                extraction.key = resolve_text(declaration.key.as_ref(), "key", &scope)?;
                extraction.limit = resolve_field(declaration.limit.as_ref(), "limit", &scope)?
                    .and_then(|limit| coerce_usize(&limit))
                    .or(self.general.limit);
                extraction.reverse = resolve_field(declaration.reverse.as_ref(), "reverse", &scope)?
                    .map(|reverse| coerce_bool(&reverse))
                    .unwrap_or(false);
            }
            ResolutionPass::Selection => {
                let DeclarationKind::Source(extraction) = &mut resolved.kind else {
                    return Ok(());
                };
                extraction.filter_from = resolve_text(declaration.filter_from.as_ref(), "filterFrom", &scope)?;
                extraction.filter_items_from = resolve_text(declaration.filter_items_from.as_ref(), "filterItemsFrom", &scope)?;
                let strategy = match (&extraction.filter_from, &extraction.filter_items_from) {
                    (Some(_), Some(_)) => return Err(EngineError::ConflictingFilterStrategy.into()),
                    (Some(_), None) => "filterFrom",
                    (None, Some(_)) => "filterItemsFrom",
                    (None, None) => return Ok(()),
                };
                let option = match (&extraction.items_path, &extraction.key) {
                    (Some(_), _) => "itemsPath",
                    (None, Some(_)) => "key",
                    (None, None) => return Ok(()),
                };
                return Err(EngineError::ConflictingExtractionStrategy { strategy, option }.into());
            }
            ResolutionPass::Command => {
                options.cmd = resolve_text(declaration.cmd.as_ref(), "cmd", &scope)?;
            }
            ResolutionPass::Sleep => {
                options.sleep = self.resolve_sleep(declaration, &scope)?;
            }
        }
        Ok(())
    }

    /// Pass 7, evaluated against the post-action context.
    pub fn resolve_sleep(&self, declaration: &StepDefinition, scope: &Value) -> Result<Option<f64>> {
        Ok(resolve_field(declaration.sleep.as_ref(), "sleep", scope)?
            .and_then(|sleep| coerce_f64(&sleep))
            .or(self.general.sleep))
    }
}

/// Resolves the workflow general options: `env` first, then the rest.
pub fn resolve_general(general: &GeneralOptions, defaults: &InvocationDefaults, ctx: &mut PublicContext) -> Result<ResolvedGeneral> {
    merge_env(general.env.as_ref(), ctx)?;
    let scope = ctx.scope()?;

    let enabled = resolve_field(general.r#if.as_ref(), "if", &scope)?
        .map(|gate| coerce_bool(&gate))
        .unwrap_or(true);
    let debug = resolve_field(general.debug.as_ref(), "debug", &scope)?
        .map(|debug| coerce_bool(&debug))
        .unwrap_or(defaults.debug);
    let database = resolve_text(general.database.as_ref(), "database", &scope)?;
    let sleep = resolve_field(general.sleep.as_ref(), "sleep", &scope)?
        .and_then(|sleep| coerce_f64(&sleep))
        .or(defaults.sleep);
    let limit = resolve_field(general.limit.as_ref(), "limit", &scope)?
        .and_then(|limit| coerce_usize(&limit))
        .or(defaults.limit);
    let force = resolve_field(general.force.as_ref(), "force", &scope)?
        .map(|force| coerce_bool(&force))
        .unwrap_or(defaults.force);

    Ok(ResolvedGeneral {
        enabled,
        debug,
        database,
        sleep,
        limit,
        force,
    })
}

/// Resolves `env` entries in order; later entries see earlier ones.
fn merge_env(env: Option<&IndexMap<String, Value>>, ctx: &mut PublicContext) -> Result<()> {
    let Some(env) = env else {
        return Ok(());
    };
    for (key, raw) in env {
        let scope = ctx.scope()?;
        let value = interpolate_value(raw, &scope).with_context(|| format!("failed to resolve env '{key}'"))?;
        ctx.env.insert(key.clone(), value);
    }
    Ok(())
}

fn resolve_field(raw: Option<&Value>, name: &str, scope: &Value) -> Result<Option<Value>> {
    raw.map(|value| interpolate_value(value, scope).with_context(|| format!("failed to resolve option '{name}'")))
        .transpose()
}

fn resolve_text(raw: Option<&Value>, name: &str, scope: &Value) -> Result<Option<String>> {
    Ok(resolve_field(raw, name, scope)?.and_then(|value| coerce_string(&value)))
}
