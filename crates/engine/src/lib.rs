//! # Pollflow Engine
//!
//! The Pollflow Engine loads declarative polling workflows and executes them:
//! data sources are fetched and turned into items, an optional filter narrows
//! them, per-item steps run in order, and an optional post stage runs once.
//! Processed item keys are remembered across runs so the same input is never
//! handled twice.
//!
//! ## Key Features
//!
//! - **Template Interpolation**: `${{ ... }}` expressions over `ctx` and `env`
//! - **Option Cascade**: declaration options fall back to workflow options, then invocation defaults
//! - **Deduplication**: bounded, most-recent-first key history persisted per workflow
//! - **State Diffing**: persisted keys are written back only when they changed
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pollflow_engine::{HandlerRegistry, RunOptions, run_batch};
//! use pollflow_util::DefaultStoreProvider;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let options = RunOptions {
//!     patterns: vec!["workflows/*.yml".into()],
//!     cwd: std::env::current_dir()?,
//!     ..Default::default()
//! };
//! let stores = DefaultStoreProvider::new(&options.cwd, "data");
//! let summary = run_batch(&options, &HandlerRegistry::with_builtins(), &stores).await?;
//! println!("ran {} workflows", summary.workflows.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`templates`** / **`expression`** / **`resolve`**: template parsing and evaluation
//! - **`options`**: the per-declaration option resolution passes
//! - **`action`**: handler registry, inline scripts and `cmd` pipes
//! - **`items`**: item extraction, filtering and deduplication
//! - **`executor`**: the stage state machine
//! - **`workflow`**: discovery, batch coordination and persistence

pub mod action;
pub mod context;
pub mod error;
pub mod executor;
pub mod expression;
pub mod items;
pub mod options;
pub mod resolve;
pub mod templates;
pub mod workflow;

pub use action::{ActionHandler, HandlerRegistry};
pub use context::{Context, PublicContext, Stage, StateChanges};
pub use error::{BatchRunError, EngineError, TemplateError};
pub use executor::{ExecutionSummary, WorkflowExecutor};
pub use options::{InvocationDefaults, OptionResolver, ResolvedGeneral, resolve_general};
pub use workflow::{BatchSummary, RunOptions, WorkflowOutcome, WorkflowStatus, run_batch};
