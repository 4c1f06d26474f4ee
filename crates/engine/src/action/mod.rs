//! Action dispatch.
//!
//! A declaration names its action with `use` and/or `from` (a registered
//! [`ActionHandler`]), or with `run` (an inline shell script). The optional
//! `cmd` post-processes the action result through a shell pipe.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde_json::Value;
use tracing::debug;

use pollflow_util::command::{CommandOutput, run_shell};

use crate::context::PublicContext;
use crate::error::EngineError;
use crate::resolve::format_json_value;

pub mod builtins;
pub mod http;

pub use builtins::{EchoHandler, ShellHandler, StateMergeHandler, StateSetHandler};
pub use http::HttpHandler;

/// A named action callable from workflow declarations.
///
/// Handlers receive the resolved `args` and mutable access to the public
/// context, so they can read items and update `ctx.state`.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value>;
}

/// Adapter turning a synchronous closure into an [`ActionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, &mut PublicContext) -> Result<Value> + Send + Sync,
{
    async fn invoke(&self, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
        (self.0)(args, ctx)
    }
}

/// Name to handler mapping consulted by the dispatcher.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let http = Arc::new(HttpHandler::new());
        registry.register("echo", EchoHandler);
        registry.register("shell", ShellHandler);
        registry.register("state.merge", StateMergeHandler);
        registry.register("state.set", StateSetHandler);
        registry.register_shared("http.get", http.clone());
        registry.register_shared("http.request", Arc::new(HttpHandler::request(http.client().clone())));
        registry
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) -> &mut Self {
        self.register_shared(name, Arc::new(handler))
    }

    pub fn register_shared(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Vec<Value>, &mut PublicContext) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(handler))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invokes the handler registered as `name`.
    pub async fn call(&self, name: &str, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
        let handler = self.get(name).ok_or_else(|| EngineError::UnknownHandler { name: name.to_string() })?;
        debug!(handler = %name, arg_count = args.len(), "invoking action handler");
        handler.invoke(args, ctx).await
    }
}

/// What a declaration asks to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<'a> {
    Handler(String),
    Script(&'a str),
    Nothing,
}

impl<'a> Action<'a> {
    /// Picks the action: a handler named by `from`/`use`, else `run`, else nothing.
    pub fn select(from: Option<&str>, uses: Option<&str>, run: Option<&'a str>) -> Self {
        if let Some(name) = handler_name(from, uses) {
            return Action::Handler(name);
        }
        match run {
            Some(script) => Action::Script(script),
            None => Action::Nothing,
        }
    }
}

/// Handler name for a `from`/`use` pair: `from.use`, `use`, or `from`.
pub fn handler_name(from: Option<&str>, uses: Option<&str>) -> Option<String> {
    match (from, uses) {
        (Some(namespace), Some(name)) => Some(format!("{namespace}.{name}")),
        (None, Some(name)) => Some(name.to_string()),
        (Some(namespace), None) => Some(namespace.to_string()),
        (None, None) => None,
    }
}

/// Executes `action` and returns its raw result.
pub async fn invoke_action(registry: &HandlerRegistry, action: &Action<'_>, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
    match action {
        Action::Handler(name) => registry.call(name, args, ctx).await,
        Action::Script(script) => run_script(script, ctx).await,
        Action::Nothing => Ok(Value::Null),
    }
}

/// Runs an inline `run` script with the serialized public context on stdin.
pub async fn run_script(script: &str, ctx: &PublicContext) -> Result<Value> {
    let input = serde_json::to_string(ctx).context("failed to serialize context for script")?;
    let output = run_shell(script, Some(&input), &ctx.shell_env()).await?;
    ensure_success(script, &output)?;
    Ok(parse_output(&output.stdout))
}

/// Outcome of a `cmd` pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Command output, parsed as JSON when possible.
    pub result: Value,
    /// Trimmed stdout.
    pub text: String,
    pub code: i32,
    pub ok: bool,
}

/// Pipes the textual form of `result` into `sh -c cmd`.
///
/// A non-zero exit is reported as [`EngineError::CommandFailed`] after the
/// outcome fields were captured into `ctx`.
pub async fn run_cmd(cmd: &str, result: &Value, ctx: &mut PublicContext) -> Result<CommandOutcome> {
    let input = format_json_value(result);
    let output = run_shell(cmd, Some(&input), &ctx.shell_env()).await?;
    let text = output.stdout.trim().to_string();
    ctx.cmd_result = Some(text.clone());
    ctx.cmd_code = Some(output.code);
    ctx.cmd_ok = Some(output.success());
    ensure_success(cmd, &output)?;

    Ok(CommandOutcome {
        result: parse_output(&output.stdout),
        text,
        code: output.code,
        ok: output.success(),
    })
}

fn ensure_success(command: &str, output: &CommandOutput) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    Err(EngineError::CommandFailed {
        command: command.to_string(),
        code: output.code,
        stderr: output.stderr.clone(),
    }
    .into())
}

/// Parses command output as JSON, falling back to the trimmed text.
pub fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
