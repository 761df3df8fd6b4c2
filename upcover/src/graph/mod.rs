//! Dependency-ordered task graph with artifact memoization.
//!
//! A [`TaskGraph`] runs blocking tasks on a bounded worker pool. Each task
//! declares the files it produces; the graph uses those declarations to skip
//! tasks whose outputs are already newer than everything upstream, and to
//! clean up outputs of tasks that failed.
//!
//! # Key Types
//!
//! - [`TaskGraph`] - registration, scheduling and joins
//! - [`TaskSpec`] - registration request (name, body, args, dependencies, targets)
//! - [`TaskStatus`] - lifecycle state of a task
//! - [`GraphError`] / [`TaskError`] - graph-level and task-level failures
//! - [`Ledger`] - persisted record of completed tasks and their arguments

mod error;
mod freshness;
mod ledger;
mod queue;
mod scheduler;
mod task;

pub use error::GraphError;
pub use freshness::{check as check_freshness, Freshness, StaleReason};
pub use ledger::{Ledger, LedgerError, LedgerMatch, LedgerRecord, LEDGER_FILE_NAME};
pub use queue::{ReadyQueue, ReadyTask};
pub use scheduler::{GraphStats, TaskGraph, TaskGraphConfig};
pub use task::{Task, TaskError, TaskErrorKind, TaskHandle, TaskSpec, TaskStatus};
