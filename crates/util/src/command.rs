//! Shell command execution.
//!
//! Commands run through `sh -c` with an explicit environment layered on top of
//! the inherited process environment. The process environment itself is never
//! modified. There is no timeout: a hung command blocks the caller.

use std::{collections::HashMap, process::Stdio};

use anyhow::{Context, Result};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Shell used to interpret command strings.
pub const DEFAULT_SHELL: &str = "sh";

/// Captured outcome of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `-1` when the process was terminated by a signal.
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs `script` with `sh -c`, feeding `stdin` when provided.
///
/// A non-zero exit is not an error here; callers decide how to treat it.
pub async fn run_shell(script: &str, stdin: Option<&str>, env: &HashMap<String, String>) -> Result<CommandOutput> {
    debug!(script = %script, has_stdin = stdin.is_some(), "spawning shell command");

    let mut command = Command::new(DEFAULT_SHELL);
    command
        .arg("-c")
        .arg(script)
        .envs(env)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn shell for command: {script}"))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        // A command that exits without reading its input closes the pipe early.
        if let Err(error) = pipe.write_all(input.as_bytes()).await {
            debug!(%error, "command closed stdin before all input was written");
        }
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for command: {script}"))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipes_stdin_and_captures_stdout() {
        let output = run_shell("tr a-z A-Z", Some("hello"), &HashMap::new()).await.expect("run command");
        assert!(output.success());
        assert_eq!(output.stdout, "HELLO");
    }

    #[tokio::test]
    async fn passes_explicit_environment() {
        let mut env = HashMap::new();
        env.insert("POLLFLOW_TEST_VALUE".to_string(), "42".to_string());
        let output = run_shell("printf %s \"$POLLFLOW_TEST_VALUE\"", None, &env).await.expect("run command");
        assert_eq!(output.stdout, "42");
        assert!(std::env::var("POLLFLOW_TEST_VALUE").is_err());
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let output = run_shell("echo oops >&2; exit 3", None, &HashMap::new()).await.expect("run command");
        assert_eq!(output.code, 3);
        assert!(!output.success());
        assert_eq!(output.stderr.trim(), "oops");
    }
}
