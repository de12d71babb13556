//! Lifecycle status shared by nodes and pipelines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution status of a node or pipeline.
///
/// Both progress through this machine exactly once per run:
/// `Pending -> (Resuming ->) Running -> Completed | Failed`, with
/// `Canceling -> Canceled` reachable from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not yet opened.
    Pending,
    /// Re-materialized from a manifest; becomes `Running` once the
    /// reader reaches its resume offset.
    Resuming,
    /// Actively processing.
    Running,
    /// Cancel requested; in-flight batches are draining.
    Canceling,
    /// Canceled before draining its input.
    Canceled,
    /// Drained its input and sealed its output.
    Completed,
    /// Terminated by an operator or I/O failure.
    Failed,
}

impl Status {
    /// Returns `true` for states no run can leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Canceled | Status::Completed | Status::Failed)
    }

    /// Returns the status name as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Resuming => "resuming",
            Status::Running => "running",
            Status::Canceling => "canceling",
            Status::Canceled => "canceled",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
