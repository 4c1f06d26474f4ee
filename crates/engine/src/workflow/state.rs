//! Per-workflow and per-batch run records.

use std::fmt;

use serde::Serialize;

use crate::context::Stage;
use crate::executor::ExecutionSummary;

/// Final status of one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// The workflow-level `if` was false; storage was never opened.
    Skipped,
    Completed,
    Failed,
}

/// Where a failed workflow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePoint {
    Load,
    Options,
    Storage,
    Stage(Stage),
    Persist,
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePoint::Load => formatter.write_str("load"),
            FailurePoint::Options => formatter.write_str("options"),
            FailurePoint::Storage => formatter.write_str("storage"),
            FailurePoint::Stage(stage) => stage.fmt(formatter),
            FailurePoint::Persist => formatter.write_str("persist"),
        }
    }
}

/// Which persisted keys were written at the end of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedKeys {
    pub state: bool,
    pub internal_state: bool,
}

/// Record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOutcome {
    pub relative_path: String,
    pub status: WorkflowStatus,
    pub summary: ExecutionSummary,
    pub persisted: PersistedKeys,
    pub failed_at: Option<FailurePoint>,
    pub error: Option<String>,
}

impl WorkflowOutcome {
    pub(crate) fn new(relative_path: &str, status: WorkflowStatus) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            status,
            summary: ExecutionSummary::default(),
            persisted: PersistedKeys::default(),
            failed_at: None,
            error: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == WorkflowStatus::Failed
    }
}

/// Outcomes of every workflow in a batch, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub workflows: Vec<WorkflowOutcome>,
}

impl BatchSummary {
    pub fn failures(&self) -> impl Iterator<Item = &WorkflowOutcome> {
        self.workflows.iter().filter(|outcome| outcome.is_failure())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}
