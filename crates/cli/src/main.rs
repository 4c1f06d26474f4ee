use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use pollflow_engine::{BatchRunError, HandlerRegistry, run_batch};
use pollflow_util::DefaultStoreProvider;
use tracing::{debug, error, info};

mod config;

use config::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let stdin = read_piped_stdin(&args)?;
    let invocation = args.into_invocation(stdin, std::env::vars())?;
    init_tracing(invocation.options.debug);

    let stores = DefaultStoreProvider::new(&invocation.options.cwd, &invocation.data_dir);
    let registry = HandlerRegistry::with_builtins();
    debug!(handlers = ?registry.names(), cwd = %invocation.options.cwd.display(), "starting batch");

    match run_batch(&invocation.options, &registry, &stores).await {
        Ok(summary) => {
            info!(workflows = summary.workflows.len(), "all workflows finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => match failure.downcast_ref::<BatchRunError>() {
            Some(batch) => {
                error!(failed = batch.failed, total = batch.total, "{batch}");
                Ok(ExitCode::FAILURE)
            }
            None => Err(failure),
        },
    }
}

/// Piped stdin is inline content, but only when nothing else names the workflows.
fn read_piped_stdin(args: &Args) -> Result<Option<String>> {
    if args.content.is_some() || !args.patterns.is_empty() || io::stdin().is_terminal() {
        return Ok(None);
    }
    let mut input = String::new();
    io::stdin().read_to_string(&mut input).context("failed to read workflow from stdin")?;
    Ok(Some(input))
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}
