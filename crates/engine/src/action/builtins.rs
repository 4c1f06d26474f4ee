//! Built-in handlers available to every workflow.

use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Value};

use pollflow_util::command::run_shell;

use super::{ActionHandler, parse_output};
use crate::context::PublicContext;
use crate::error::EngineError;
use crate::resolve::format_json_value;

/// `echo`: returns its single argument, or the argument list.
pub struct EchoHandler;

#[async_trait::async_trait]
impl ActionHandler for EchoHandler {
    async fn invoke(&self, mut args: Vec<Value>, _ctx: &mut PublicContext) -> Result<Value> {
        Ok(match args.len() {
            0 => Value::Null,
            1 => args.remove(0),
            _ => Value::Array(args),
        })
    }
}

/// `shell`: runs `args[0]` through `sh -c`, piping `args[1]` (if any) to stdin.
pub struct ShellHandler;

#[async_trait::async_trait]
impl ActionHandler for ShellHandler {
    async fn invoke(&self, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
        let Some(Value::String(script)) = args.first() else {
            bail!("shell expects a command string as its first argument");
        };
        let stdin = args.get(1).map(format_json_value);
        let output = run_shell(script, stdin.as_deref(), &ctx.shell_env()).await?;
        if !output.success() {
            return Err(EngineError::CommandFailed {
                command: script.clone(),
                code: output.code,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(parse_output(&output.stdout))
    }
}

/// `state.merge`: shallow-merges an object argument into `ctx.state`.
pub struct StateMergeHandler;

#[async_trait::async_trait]
impl ActionHandler for StateMergeHandler {
    async fn invoke(&self, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
        let patch = match args.into_iter().next() {
            Some(Value::Object(map)) => map,
            Some(other) => return Err(anyhow!("state.merge expects an object, got {other}")),
            None => bail!("state.merge expects an object argument"),
        };
        let mut state = match std::mem::take(&mut ctx.state) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        state.extend(patch);
        ctx.state = Value::Object(state);
        Ok(ctx.state.clone())
    }
}

/// `state.set`: replaces `ctx.state` with its argument.
pub struct StateSetHandler;

#[async_trait::async_trait]
impl ActionHandler for StateSetHandler {
    async fn invoke(&self, args: Vec<Value>, ctx: &mut PublicContext) -> Result<Value> {
        ctx.state = args.into_iter().next().unwrap_or(Value::Null);
        Ok(ctx.state.clone())
    }
}
