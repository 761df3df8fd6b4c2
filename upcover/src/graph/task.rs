//! Task trait and related types.
//!
//! A task is a single blocking unit of work registered with a
//! [`TaskGraph`](super::TaskGraph). Tasks declare the artifacts they produce
//! through a [`TaskSpec`]; the graph uses those declarations for dependency
//! ordering and for skipping work whose outputs are already up to date.
//!
//! # Example
//!
//! ```ignore
//! use upcover::graph::{TaskError, TaskSpec};
//!
//! let spec = TaskSpec::new("write_marker", move || {
//!     std::fs::write(&marker, b"done").map_err(|e| TaskError::external("write failed").with_source(e))
//! })
//! .target(marker_path)
//! .depends_on(&upstream);
//! let handle = graph.add_task(spec)?;
//! ```

use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

/// A single blocking operation within a task graph.
///
/// Tasks are the atomic units of work in the graph. A task body runs on a
/// worker thread once all of its dependencies have succeeded, and must
/// create every target declared in its [`TaskSpec`].
///
/// Any `Fn() -> Result<(), TaskError>` closure is a task.
pub trait Task: Send + Sync + 'static {
    /// Executes the task.
    fn execute(&self) -> Result<(), TaskError>;
}

impl<F> Task for F
where
    F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
{
    fn execute(&self) -> Result<(), TaskError> {
        self()
    }
}

/// Opaque handle to a registered task.
///
/// Handles are returned by [`TaskGraph::add_task`](super::TaskGraph::add_task)
/// and are used to declare dependencies and to query status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub(crate) usize);

impl TaskHandle {
    /// Registration index of the task (0-based).
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registration request for a task.
///
/// Built with a name and a task body, then extended with its serializable
/// arguments, dependencies, declared targets and any extra input files.
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) task: Box<dyn Task>,
    pub(crate) args: Value,
    pub(crate) dependencies: Vec<TaskHandle>,
    pub(crate) targets: Vec<PathBuf>,
    pub(crate) inputs: Vec<PathBuf>,
}

impl TaskSpec {
    /// Creates a spec with no arguments, dependencies or targets.
    pub fn new(name: impl Into<String>, task: impl Task) -> Self {
        Self {
            name: name.into(),
            task: Box::new(task),
            args: Value::Null,
            dependencies: Vec::new(),
            targets: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Sets the arguments that identify this unit of work.
    ///
    /// The arguments are fingerprinted and recorded in the completion
    /// ledger; changing them invalidates previously produced targets.
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Adds a dependency on a previously registered task.
    pub fn depends_on(mut self, handle: &TaskHandle) -> Self {
        self.dependencies.push(*handle);
        self
    }

    /// Declares an artifact this task is responsible for creating.
    pub fn target(mut self, path: impl Into<PathBuf>) -> Self {
        self.targets.push(path.into());
        self
    }

    /// Declares a source file read by this task but produced outside the graph.
    ///
    /// Inputs take part in staleness checks: a target older than any input
    /// is rebuilt.
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// Returns the task name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("dependencies", &self.dependencies)
            .field("targets", &self.targets)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// Lifecycle state of a registered task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies satisfied, waiting for a worker.
    Scheduled,
    /// Executing on a worker.
    Running,
    /// Task body ran and produced all of its targets.
    Succeeded,
    /// Targets were already up to date; the body was not run.
    Cached,
    /// Task body returned an error or did not produce its targets.
    Failed,
    /// A dependency failed, so the task was never run.
    UpstreamFailed,
}

impl TaskStatus {
    /// Returns true once the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Cached | Self::Failed | Self::UpstreamFailed
        )
    }

    /// Returns true if dependents may run after this task.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }

    /// Returns true for `Failed` and `UpstreamFailed`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::UpstreamFailed)
    }

    /// Short lowercase label for logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Cached => "cached",
            Self::Failed => "failed",
            Self::UpstreamFailed => "upstream-failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a task failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The task body itself failed.
    Execution,
    /// A raster store or routing engine call failed.
    External,
    /// The task reported success but a declared target is missing.
    ArtifactMissing,
    /// The task panicked.
    Panicked,
}

/// Error type for task failures.
#[derive(Debug)]
pub struct TaskError {
    /// What went wrong, broadly.
    kind: TaskErrorKind,
    /// Human-readable error message.
    message: String,
    /// Optional source error.
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Creates a new execution error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error for a failing external collaborator.
    pub fn external(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::External,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error for a declared target that was not produced.
    pub fn artifact_missing(path: &std::path::Path) -> Self {
        Self {
            kind: TaskErrorKind::ArtifactMissing,
            message: format!("declared target was not produced: {}", path.display()),
            source: None,
        }
    }

    /// Creates an error for a task body that panicked.
    pub fn panicked(detail: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Panicked,
            message: format!("task panicked: {}", detail.into()),
            source: None,
        }
    }

    /// Attaches a source error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the failure classification.
    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_status_terminal_and_success() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Cached.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::UpstreamFailed.is_terminal());

        assert!(TaskStatus::Succeeded.is_success());
        assert!(TaskStatus::Cached.is_success());
        assert!(!TaskStatus::Failed.is_success());
        assert!(TaskStatus::UpstreamFailed.is_failure());
    }

    #[test]
    fn test_task_error_new() {
        let err = TaskError::new("something went wrong");
        assert_eq!(err.message(), "something went wrong");
        assert_eq!(err.kind(), TaskErrorKind::Execution);
        assert!(err.source().is_none());
    }

    #[test]
    fn test_task_error_with_source_display() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = TaskError::external("raster store failed").with_source(io);
        assert_eq!(err.kind(), TaskErrorKind::External);
        assert_eq!(err.to_string(), "raster store failed: no such file");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_task_error_artifact_missing() {
        let err = TaskError::artifact_missing(std::path::Path::new("/tmp/out.tif"));
        assert_eq!(err.kind(), TaskErrorKind::ArtifactMissing);
        assert!(err.message().contains("/tmp/out.tif"));
    }

    #[test]
    fn test_closure_is_task() {
        let task: Box<dyn Task> = Box::new(|| Err(TaskError::new("nope")));
        assert!(task.execute().is_err());
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::new("stage", || Ok(()))
            .args(serde_json::json!({"model": "d8"}))
            .depends_on(&TaskHandle(3))
            .target("/ws/out.tif")
            .input("/data/dem.tif");

        assert_eq!(spec.name(), "stage");
        assert_eq!(spec.dependencies, vec![TaskHandle(3)]);
        assert_eq!(spec.targets, vec![PathBuf::from("/ws/out.tif")]);
        assert_eq!(spec.inputs, vec![PathBuf::from("/data/dem.tif")]);
        assert!(format!("{:?}", spec).contains("TaskSpec"));
    }
}
