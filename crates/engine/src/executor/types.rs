//! Core executor data types.

use serde::Serialize;

use pollflow_types::StepResponse;

use crate::options::ResolvedDeclaration;

/// Phases of a workflow run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Sources,
    Filter,
    Steps,
    Post,
    Finalize,
}

/// Result of executing one declaration.
#[derive(Debug, Clone)]
pub enum DeclarationOutcome {
    /// The `if` gate was false.
    Skipped,
    Completed {
        resolved: Box<ResolvedDeclaration>,
        response: StepResponse,
    },
}

/// A declaration failure, carrying the id when resolution got far enough to know it.
#[derive(Debug)]
pub struct DeclarationFailure {
    pub id: Option<String>,
    /// Set when `cmd` ran and exited non-zero.
    pub command: Option<FailedCommand>,
    pub error: anyhow::Error,
}

/// Output of a `cmd` that exited non-zero; kept on the recorded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCommand {
    pub text: String,
    pub code: i32,
}

/// Counters reported for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    /// Items aggregated by the sources.
    pub aggregated: usize,
    /// Items remaining after the filter stage.
    pub selected: usize,
    /// Items whose step loop ran to completion or was cut short by `continueOnError`.
    pub processed: usize,
    /// Keys newly added to the dedup history.
    pub remembered: usize,
}
