//! Invocation options: command-line flags, environment, and `.env` seeding.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use pollflow_engine::RunOptions;
use pollflow_util::DEFAULT_DATA_DIR;
use serde_json::Value;
use tracing::warn;

/// Patterns used when neither patterns nor inline content are given.
pub const DEFAULT_PATTERNS: [&str; 2] = ["workflows/*.yml", "workflows/*.yaml"];

/// Run polling workflows once and persist what they have seen.
#[derive(Parser, Debug, Default)]
#[command(name = "pollflow", version, about)]
pub struct Args {
    /// Workflow file glob patterns, relative to the working directory
    pub patterns: Vec<String>,

    /// Inline workflow document (YAML or JSON) instead of files
    #[arg(long)]
    pub content: Option<String>,

    /// Log resolved options of every declaration
    #[arg(long)]
    pub debug: bool,

    /// Default maximum number of items taken from each source
    #[arg(long)]
    pub limit: Option<usize>,

    /// Process items even when their key was seen before
    #[arg(long)]
    pub force: bool,

    /// Default pause in seconds after each declaration
    #[arg(long)]
    pub sleep: Option<f64>,

    /// Storage descriptor, e.g. `sqlite://data/state.db` or `json://state`
    #[arg(long)]
    pub database: Option<String>,

    /// Directory holding JSON state files when no database is configured
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Directory workflows and relative paths are resolved against
    #[arg(long)]
    pub cwd: Option<PathBuf>,
}

/// Everything `main` needs to start a batch.
#[derive(Debug)]
pub struct Invocation {
    pub options: RunOptions,
    pub data_dir: PathBuf,
}

impl Args {
    /// Merges flags with the environment.
    ///
    /// `stdin` is used as inline content when neither patterns nor `--content`
    /// were given. `process_env` seeds `ctx.env`; `.env` in the working
    /// directory only fills in variables the process does not define.
    pub fn into_invocation(self, stdin: Option<String>, process_env: impl IntoIterator<Item = (String, String)>) -> Result<Invocation> {
        let cwd = match self.cwd {
            Some(cwd) if cwd.is_absolute() => cwd,
            Some(cwd) => std::env::current_dir().context("failed to read current directory")?.join(cwd),
            None => std::env::current_dir().context("failed to read current directory")?,
        };

        let mut env: IndexMap<String, Value> = process_env.into_iter().map(|(key, value)| (key, Value::String(value))).collect();
        for (key, value) in read_dotenv(&cwd.join(".env"))? {
            env.entry(key).or_insert(Value::String(value));
        }
        let debug = self.debug || env_flag(&env, "POLLFLOW_DEBUG") || env_flag(&env, "DEBUG");

        let content = self.content.or_else(|| {
            if self.patterns.is_empty() {
                stdin.filter(|text| !text.trim().is_empty())
            } else {
                None
            }
        });
        let patterns = if self.patterns.is_empty() && content.is_none() {
            DEFAULT_PATTERNS.iter().map(|pattern| pattern.to_string()).collect()
        } else {
            self.patterns
        };

        Ok(Invocation {
            options: RunOptions {
                patterns,
                content,
                cwd,
                env,
                debug,
                limit: self.limit,
                force: self.force,
                sleep: self.sleep,
                database: self.database,
            },
            data_dir: self.data_dir,
        })
    }
}

fn env_flag(env: &IndexMap<String, Value>, name: &str) -> bool {
    env.get(name)
        .and_then(Value::as_str)
        .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

/// Reads `KEY=value` pairs without touching the process environment.
fn read_dotenv(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let entries = dotenvy::from_path_iter(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut pairs = Vec::new();
    for entry in entries {
        match entry {
            Ok(pair) => pairs.push(pair),
            Err(error) => warn!(path = %path.display(), error = %error, "skipping malformed .env line"),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(cwd: &Path) -> Args {
        Args {
            cwd: Some(cwd.to_path_buf()),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            ..Default::default()
        }
    }

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from(["pollflow", "jobs/*.yml", "--limit", "5", "--sleep", "0.5", "--force", "--database", "sqlite::memory:"]).unwrap();
        assert_eq!(args.patterns, vec!["jobs/*.yml"]);
        assert_eq!(args.limit, Some(5));
        assert_eq!(args.sleep, Some(0.5));
        assert!(args.force);
        assert_eq!(args.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn defaults_patterns_and_reads_stdin_only_without_patterns() {
        let temp = tempfile::tempdir().unwrap();
        let invocation = args(temp.path()).into_invocation(None, Vec::new()).unwrap();
        assert_eq!(invocation.options.patterns, DEFAULT_PATTERNS.map(String::from).to_vec());

        let invocation = args(temp.path()).into_invocation(Some("sources: []".into()), Vec::new()).unwrap();
        assert!(invocation.options.patterns.is_empty());
        assert_eq!(invocation.options.content.as_deref(), Some("sources: []"));

        let explicit = Args {
            patterns: vec!["a.yml".into()],
            ..args(temp.path())
        };
        let invocation = explicit.into_invocation(Some("sources: []".into()), Vec::new()).unwrap();
        assert_eq!(invocation.options.content, None);
    }

    #[test]
    fn dotenv_fills_missing_variables_only() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join(".env"), "TOKEN=from-file\nREGION=eu\nPOLLFLOW_DEBUG=true\n").unwrap();
        let invocation = args(temp.path())
            .into_invocation(None, vec![("TOKEN".to_string(), "from-process".to_string())])
            .unwrap();
        let env = &invocation.options.env;
        assert_eq!(env["TOKEN"], Value::String("from-process".into()));
        assert_eq!(env["REGION"], Value::String("eu".into()));
        assert!(invocation.options.debug);
    }
}
