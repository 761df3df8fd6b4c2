//! Task graph error types.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use super::ledger::LedgerError;
use super::task::TaskError;

/// Errors raised by [`TaskGraph`](super::TaskGraph) registration and joins.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A task was registered without declaring any target artifact.
    #[error("task '{task}' declares no target artifacts")]
    MissingTargets { task: String },

    /// A dependency handle does not refer to a registered task.
    #[error("task '{task}' depends on unknown task handle #{handle}")]
    UnknownDependency { task: String, handle: usize },

    /// Two tasks claim the same target path.
    #[error("target {path} of task '{task}' is already produced by task '{owner}'")]
    DuplicateTarget {
        path: PathBuf,
        task: String,
        owner: String,
    },

    /// Adding a dependency would create a cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A dependency was added to a task that has already been dispatched.
    #[error("task '{task}' has already been dispatched ({status})")]
    AlreadyDispatched { task: String, status: String },

    /// The graph no longer accepts tasks.
    #[error("task graph is closed")]
    Closed,

    /// A task failed; dependents of it were not run.
    #[error("task '{task}' failed: {error}")]
    TaskFailed {
        task: String,
        #[source]
        error: Arc<TaskError>,
    },

    /// The completion ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Workspace or worker setup failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GraphError {
    /// Returns the name of the failing task for `TaskFailed`.
    pub fn failed_task(&self) -> Option<&str> {
        match self {
            Self::TaskFailed { task, .. } => Some(task),
            _ => None,
        }
    }

    /// Returns true for errors caused by how the graph was wired.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::MissingTargets { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicateTarget { .. }
                | Self::CycleDetected { .. }
                | Self::AlreadyDispatched { .. }
        )
    }
}
