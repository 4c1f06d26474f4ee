//! Workflow discovery, batch coordination, and run records.

pub mod document;
pub mod runner;
pub mod state;

pub use document::{INLINE_WORKFLOW_PATH, WorkflowSource, discover_workflows, parse_workflow_content, parse_workflow_file};
pub use runner::{RunOptions, run_batch, run_workflow};
pub use state::{BatchSummary, FailurePoint, PersistedKeys, WorkflowOutcome, WorkflowStatus};
