//! The task graph scheduler.
//!
//! [`TaskGraph`] owns every registered task, a bounded pool of worker
//! threads and the completion ledger. Registration is cheap and never runs
//! work; workers pull ready tasks in registration order as soon as their
//! dependencies have succeeded.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          TaskGraph                            │
//! │                                                               │
//! │  add_task ──► ┌────────────┐  deps met  ┌────────────┐        │
//! │               │  Pending   │ ─────────► │ ReadyQueue │        │
//! │               └────────────┘            └─────┬──────┘        │
//! │                                               │ FIFO          │
//! │                                               ▼               │
//! │                                       ┌──────────────┐        │
//! │                                       │ Worker (1..N) │       │
//! │                                       └──────┬───────┘        │
//! │                          fresh? ──► Cached   │                │
//! │                          run    ──► Succeeded / Failed        │
//! │                                              │                │
//! │                 Failed ──► dependents UpstreamFailed          │
//! │                 Succeeded/Cached ──► release dependents       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! With zero workers the graph runs in deferred mode: nothing executes until
//! [`TaskGraph::join`], which drains the ready queue on the calling thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::error::GraphError;
use super::freshness::{self, Freshness, StaleReason};
use super::ledger::{Ledger, LedgerMatch, LEDGER_FILE_NAME};
use super::queue::{ReadyQueue, ReadyTask};
use super::task::{Task, TaskError, TaskHandle, TaskSpec, TaskStatus};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`TaskGraph`].
#[derive(Clone, Debug)]
pub struct TaskGraphConfig {
    /// Directory holding the completion ledger. Created if missing.
    pub workspace: PathBuf,

    /// Number of worker threads. Zero selects deferred in-thread execution.
    pub workers: usize,

    /// Whether the completion ledger is persisted in the workspace.
    pub persist_ledger: bool,
}

impl TaskGraphConfig {
    /// Creates a config with one worker per available core and a persisted ledger.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            workspace: workspace.into(),
            workers,
            persist_ledger: true,
        }
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enable or disable the on-disk ledger.
    pub fn with_ledger(mut self, persist: bool) -> Self {
        self.persist_ledger = persist;
        self
    }
}

/// Counts of tasks by outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Total registered tasks.
    pub total: usize,
    /// Task bodies executed successfully.
    pub executed: usize,
    /// Tasks skipped because their targets were up to date.
    pub cached: usize,
    /// Tasks whose body failed.
    pub failed: usize,
    /// Tasks abandoned because a dependency failed.
    pub upstream_failed: usize,
    /// Tasks not yet terminal.
    pub pending: usize,
}

// =============================================================================
// Internal state
// =============================================================================

struct TaskNode {
    name: String,
    task: Arc<dyn Task>,
    key: String,
    fingerprint: String,
    dependencies: Vec<TaskHandle>,
    dependents: Vec<TaskHandle>,
    targets: Vec<PathBuf>,
    inputs: Vec<PathBuf>,
    unmet_dependencies: usize,
    status: TaskStatus,
    /// Root cause for `Failed` (itself) and `UpstreamFailed` (an ancestor).
    root_cause: Option<TaskHandle>,
    error: Option<Arc<TaskError>>,
}

/// Work handed to a worker, detached from the state lock.
struct Dispatch {
    handle: TaskHandle,
    name: String,
    task: Arc<dyn Task>,
    key: String,
    fingerprint: String,
    targets: Vec<PathBuf>,
    upstream: Vec<PathBuf>,
    upstream_executed: bool,
}

enum Outcome {
    Executed,
    Cached,
    Failed(TaskError),
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<TaskNode>,
    ready: ReadyQueue,
    claimed_targets: HashMap<PathBuf, TaskHandle>,
    unfinished: usize,
    first_failure: Option<TaskHandle>,
    closed: bool,
    shutdown: bool,
}

impl GraphState {
    fn node(&self, handle: TaskHandle) -> &TaskNode {
        &self.nodes[handle.0]
    }

    fn node_mut(&mut self, handle: TaskHandle) -> &mut TaskNode {
        &mut self.nodes[handle.0]
    }

    fn schedule(&mut self, handle: TaskHandle) {
        self.node_mut(handle).status = TaskStatus::Scheduled;
        self.ready.push(ReadyTask::new(handle));
    }

    /// Pops the next ready task and marks it running.
    fn dispatch_next(&mut self) -> Option<Dispatch> {
        let ready = self.ready.pop()?;
        let handle = ready.handle;

        let mut upstream = Vec::new();
        let mut upstream_executed = false;
        for dep in &self.node(handle).dependencies {
            let dep_node = self.node(*dep);
            upstream.extend(dep_node.targets.iter().cloned());
            upstream_executed |= dep_node.status == TaskStatus::Succeeded;
        }

        let node = self.node_mut(handle);
        node.status = TaskStatus::Running;
        upstream.extend(node.inputs.iter().cloned());

        debug!(
            task = %node.name,
            wait_ms = ready.wait_time().as_millis() as u64,
            "Dispatching task"
        );

        Some(Dispatch {
            handle,
            name: node.name.clone(),
            task: Arc::clone(&node.task),
            key: node.key.clone(),
            fingerprint: node.fingerprint.clone(),
            targets: node.targets.clone(),
            upstream,
            upstream_executed,
        })
    }

    /// Marks every transitive dependent of `from` as upstream-failed, blaming
    /// `root` as the task that actually failed.
    ///
    /// Returns the tasks that were abandoned.
    fn propagate_failure(&mut self, from: TaskHandle, root: TaskHandle) -> Vec<TaskHandle> {
        let mut abandoned = Vec::new();
        let mut queue: VecDeque<TaskHandle> = self.node(from).dependents.iter().copied().collect();

        while let Some(handle) = queue.pop_front() {
            let status = self.node(handle).status;
            if status.is_terminal() || status == TaskStatus::Running {
                continue;
            }
            if status == TaskStatus::Scheduled {
                self.ready.remove(handle);
            }

            let error = self.node(root).error.clone();
            let node = self.node_mut(handle);
            node.status = TaskStatus::UpstreamFailed;
            node.root_cause = Some(root);
            node.error = error;
            queue.extend(node.dependents.iter().copied());
            self.unfinished -= 1;
            abandoned.push(handle);
        }

        abandoned
    }

    /// Returns the dependency chain from `from` to `to`, if one exists.
    fn dependency_path(&self, from: TaskHandle, to: TaskHandle) -> Option<Vec<TaskHandle>> {
        let mut parents: HashMap<TaskHandle, TaskHandle> = HashMap::new();
        let mut visited: HashSet<TaskHandle> = HashSet::from([from]);
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(parent) = parents.get(&cursor) {
                    path.push(*parent);
                    cursor = *parent;
                }
                path.reverse();
                return Some(path);
            }
            for dep in &self.node(current).dependencies {
                if visited.insert(*dep) {
                    parents.insert(*dep, current);
                    stack.push(*dep);
                }
            }
        }
        None
    }

    fn failure_error(&self, root: TaskHandle) -> GraphError {
        let node = self.node(root);
        GraphError::TaskFailed {
            task: node.name.clone(),
            error: node
                .error
                .clone()
                .unwrap_or_else(|| Arc::new(TaskError::new("task failed"))),
        }
    }

    fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.nodes.len(),
            ..GraphStats::default()
        };
        for node in &self.nodes {
            match node.status {
                TaskStatus::Succeeded => stats.executed += 1,
                TaskStatus::Cached => stats.cached += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::UpstreamFailed => stats.upstream_failed += 1,
                _ => stats.pending += 1,
            }
        }
        stats
    }
}

struct Shared {
    state: Mutex<GraphState>,
    /// Signalled when tasks become ready or on shutdown.
    work_available: Condvar,
    /// Signalled whenever a task reaches a terminal state.
    progress: Condvar,
    ledger: Ledger,
}

impl Shared {
    /// Decides whether a dispatched task can be skipped, otherwise runs it.
    fn run(&self, dispatch: &Dispatch) -> Outcome {
        let stale = match freshness::check(
            &dispatch.targets,
            &dispatch.upstream,
            dispatch.upstream_executed,
        ) {
            Ok(Freshness::Fresh) => {
                match self.ledger.lookup(&dispatch.key, &dispatch.fingerprint) {
                    LedgerMatch::Changed => Some(StaleReason::ArgumentsChanged.to_string()),
                    LedgerMatch::Same | LedgerMatch::Absent => None,
                }
            }
            Ok(Freshness::Stale(reason)) => Some(reason.to_string()),
            Err(e) => Some(format!("freshness check failed: {}", e)),
        };

        match stale {
            None => {
                debug!(task = %dispatch.name, "Targets up to date, skipping");
                return Outcome::Cached;
            }
            Some(reason) => debug!(task = %dispatch.name, reason = %reason, "Task is stale"),
        }

        for target in &dispatch.targets {
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = fs::create_dir_all(parent) {
                    return Outcome::Failed(
                        TaskError::new(format!(
                            "cannot create directory {}",
                            parent.display()
                        ))
                        .with_source(e),
                    );
                }
            }
        }

        let started = Instant::now();
        info!(task = %dispatch.name, "Running task");
        let result = catch_unwind(AssertUnwindSafe(|| dispatch.task.execute()));

        let outcome = match result {
            Ok(Ok(())) => match dispatch.targets.iter().find(|t| !t.exists()) {
                Some(missing) => Outcome::Failed(TaskError::artifact_missing(missing)),
                None => Outcome::Executed,
            },
            Ok(Err(e)) => Outcome::Failed(e),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Outcome::Failed(TaskError::panicked(detail))
            }
        };

        debug!(
            task = %dispatch.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task body finished"
        );
        outcome
    }

    /// Records an outcome, releases or abandons dependents and wakes waiters.
    fn complete(&self, dispatch: Dispatch, outcome: Outcome) {
        let mut stale_targets: Vec<PathBuf> = Vec::new();
        let mut forget_keys: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            let handle = dispatch.handle;

            let executed = matches!(outcome, Outcome::Executed);
            match outcome {
                Outcome::Executed | Outcome::Cached => {
                    let status = if executed {
                        self.ledger
                            .record(&dispatch.key, &dispatch.name, &dispatch.fingerprint);
                        info!(task = %dispatch.name, "Task succeeded");
                        TaskStatus::Succeeded
                    } else {
                        info!(task = %dispatch.name, "Task cached");
                        TaskStatus::Cached
                    };
                    state.node_mut(handle).status = status;

                    let dependents = state.node(handle).dependents.clone();
                    for dependent in dependents {
                        let node = state.node_mut(dependent);
                        if node.status != TaskStatus::Pending {
                            continue;
                        }
                        node.unmet_dependencies -= 1;
                        if node.unmet_dependencies == 0 {
                            state.schedule(dependent);
                        }
                    }
                }
                Outcome::Failed(err) => {
                    error!(task = %dispatch.name, error = %err, "Task failed");
                    let node = state.node_mut(handle);
                    node.status = TaskStatus::Failed;
                    node.root_cause = Some(handle);
                    node.error = Some(Arc::new(err));
                    if state.first_failure.is_none() {
                        state.first_failure = Some(handle);
                    }

                    stale_targets.extend(dispatch.targets.iter().cloned());
                    forget_keys.push(dispatch.key.clone());
                    for abandoned in state.propagate_failure(handle, handle) {
                        let node = state.node(abandoned);
                        warn!(
                            task = %node.name,
                            root_cause = %dispatch.name,
                            "Task abandoned after upstream failure"
                        );
                        stale_targets.extend(node.targets.iter().cloned());
                        forget_keys.push(node.key.clone());
                    }
                }
            }

            state.unfinished -= 1;
            self.work_available.notify_all();
            self.progress.notify_all();
        }

        for key in &forget_keys {
            self.ledger.forget(key);
        }
        remove_stale_targets(&stale_targets);
        if let Err(e) = self.ledger.flush() {
            warn!(error = %e, "Failed to persist task ledger");
        }
    }
}

fn remove_stale_targets(targets: &[PathBuf]) {
    for target in targets {
        match fs::remove_file(target) {
            Ok(()) => debug!(path = %target.display(), "Removed stale target"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %target.display(), error = %e, "Failed to remove stale target"),
        }
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "Worker started");
    loop {
        let dispatch = {
            let mut state = shared.state.lock();
            loop {
                if let Some(dispatch) = state.dispatch_next() {
                    break dispatch;
                }
                if state.shutdown {
                    debug!(worker = index, "Worker stopping");
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };
        let outcome = shared.run(&dispatch);
        shared.complete(dispatch, outcome);
    }
}

// =============================================================================
// TaskGraph
// =============================================================================

/// Dependency-ordered, cached, parallel task executor.
///
/// # Example
///
/// ```ignore
/// use upcover::graph::{TaskGraph, TaskGraphConfig, TaskSpec};
///
/// let graph = TaskGraph::new(TaskGraphConfig::new("workspace").with_workers(4))?;
/// let a = graph.add_task(TaskSpec::new("a", write_a).target("workspace/a.txt"))?;
/// let b = graph.add_task(TaskSpec::new("b", write_b).depends_on(&a).target("workspace/b.txt"))?;
/// graph.join()?;
/// graph.close()?;
/// ```
pub struct TaskGraph {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    workspace: PathBuf,
}

impl TaskGraph {
    /// Creates a graph, its workspace directory and its worker threads.
    pub fn new(config: TaskGraphConfig) -> Result<Self, GraphError> {
        fs::create_dir_all(&config.workspace).map_err(|source| GraphError::Io {
            path: config.workspace.clone(),
            source,
        })?;

        let ledger = if config.persist_ledger {
            Ledger::open(config.workspace.join(LEDGER_FILE_NAME))?
        } else {
            Ledger::in_memory()
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(GraphState::default()),
            work_available: Condvar::new(),
            progress: Condvar::new(),
            ledger,
        });

        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("taskgraph-worker-{}", index))
                .spawn(move || worker_loop(worker_shared, index))
                .map_err(|source| GraphError::Io {
                    path: config.workspace.clone(),
                    source,
                })?;
            handles.push(handle);
        }

        info!(
            workspace = %config.workspace.display(),
            workers = config.workers,
            ledger = config.persist_ledger,
            "Task graph started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            worker_count: config.workers,
            workspace: config.workspace,
        })
    }

    /// Returns the workspace directory.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Returns the number of worker threads (zero in deferred mode).
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Registers a task.
    ///
    /// The task runs once every dependency has succeeded and a worker is
    /// free. A task registered behind an already failed dependency is marked
    /// upstream-failed immediately.
    pub fn add_task(&self, spec: TaskSpec) -> Result<TaskHandle, GraphError> {
        let TaskSpec {
            name,
            task,
            args,
            dependencies,
            targets,
            inputs,
        } = spec;

        if targets.is_empty() {
            return Err(GraphError::MissingTargets { task: name });
        }

        let key = Ledger::task_key(&targets);
        let fingerprint = Ledger::fingerprint(&args);

        let mut stale_targets = Vec::new();
        let handle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(GraphError::Closed);
            }

            let mut unique_deps: Vec<TaskHandle> = Vec::with_capacity(dependencies.len());
            for dep in dependencies {
                if dep.0 >= state.nodes.len() {
                    return Err(GraphError::UnknownDependency {
                        task: name,
                        handle: dep.0,
                    });
                }
                if !unique_deps.contains(&dep) {
                    unique_deps.push(dep);
                }
            }

            let mut seen = HashSet::new();
            for target in &targets {
                if let Some(owner) = state.claimed_targets.get(target) {
                    return Err(GraphError::DuplicateTarget {
                        path: target.clone(),
                        task: name,
                        owner: state.node(*owner).name.clone(),
                    });
                }
                if !seen.insert(target) {
                    return Err(GraphError::DuplicateTarget {
                        path: target.clone(),
                        owner: name.clone(),
                        task: name,
                    });
                }
            }

            let handle = TaskHandle(state.nodes.len());
            let failed_dep = unique_deps
                .iter()
                .copied()
                .find(|d| state.node(*d).status.is_failure());
            let unmet = unique_deps
                .iter()
                .filter(|d| !state.node(**d).status.is_success())
                .count();

            for dep in &unique_deps {
                state.node_mut(*dep).dependents.push(handle);
            }
            for target in &targets {
                state.claimed_targets.insert(target.clone(), handle);
            }

            let (status, root_cause, error) = match failed_dep {
                Some(dep) => {
                    let root = state.node(dep).root_cause.unwrap_or(dep);
                    (
                        TaskStatus::UpstreamFailed,
                        Some(root),
                        state.node(root).error.clone(),
                    )
                }
                None => (TaskStatus::Pending, None, None),
            };

            debug!(task = %name, handle = %handle, deps = unique_deps.len(), "Registered task");

            state.nodes.push(TaskNode {
                name,
                task: Arc::from(task),
                key,
                fingerprint,
                dependencies: unique_deps,
                dependents: Vec::new(),
                targets,
                inputs,
                unmet_dependencies: unmet,
                status,
                root_cause,
                error,
            });

            if status == TaskStatus::UpstreamFailed {
                stale_targets.extend(state.node(handle).targets.iter().cloned());
                self.shared.progress.notify_all();
            } else {
                state.unfinished += 1;
                if unmet == 0 {
                    state.schedule(handle);
                    self.shared.work_available.notify_one();
                }
            }
            handle
        };

        remove_stale_targets(&stale_targets);
        Ok(handle)
    }

    /// Adds a dependency edge between two registered tasks.
    ///
    /// Only allowed while `dependent` has not been dispatched. Edges that
    /// would close a cycle (including a task depending on itself) are
    /// rejected here rather than deadlocking a later join.
    pub fn add_dependency(
        &self,
        dependent: &TaskHandle,
        dependency: &TaskHandle,
    ) -> Result<(), GraphError> {
        let mut stale_targets = Vec::new();
        {
            let mut state = self.shared.state.lock();
            for handle in [dependent, dependency] {
                if handle.0 >= state.nodes.len() {
                    return Err(GraphError::UnknownDependency {
                        task: format!("{}", dependent),
                        handle: handle.0,
                    });
                }
            }

            let status = state.node(*dependent).status;
            if !matches!(status, TaskStatus::Pending | TaskStatus::Scheduled) {
                return Err(GraphError::AlreadyDispatched {
                    task: state.node(*dependent).name.clone(),
                    status: status.to_string(),
                });
            }

            if let Some(path) = state.dependency_path(*dependency, *dependent) {
                let mut names: Vec<String> = vec![state.node(*dependent).name.clone()];
                names.extend(path.iter().map(|h| state.node(*h).name.clone()));
                return Err(GraphError::CycleDetected { path: names });
            }

            if state.node(*dependent).dependencies.contains(dependency) {
                return Ok(());
            }

            state.node_mut(*dependent).dependencies.push(*dependency);
            state.node_mut(*dependency).dependents.push(*dependent);

            let dep_status = state.node(*dependency).status;
            if dep_status.is_failure() {
                let root = state.node(*dependency).root_cause.unwrap_or(*dependency);
                if status == TaskStatus::Scheduled {
                    state.ready.remove(*dependent);
                }
                let error = state.node(root).error.clone();
                let node = state.node_mut(*dependent);
                node.status = TaskStatus::UpstreamFailed;
                node.root_cause = Some(root);
                node.error = error;
                stale_targets.extend(node.targets.iter().cloned());
                state.unfinished -= 1;
                for abandoned in state.propagate_failure(*dependent, root) {
                    stale_targets.extend(state.node(abandoned).targets.iter().cloned());
                }
                self.shared.progress.notify_all();
            } else if !dep_status.is_success() {
                if status == TaskStatus::Scheduled {
                    state.ready.remove(*dependent);
                    state.node_mut(*dependent).status = TaskStatus::Pending;
                }
                state.node_mut(*dependent).unmet_dependencies += 1;
            }
        }

        remove_stale_targets(&stale_targets);
        Ok(())
    }

    /// Blocks until every registered task is terminal.
    ///
    /// Returns the first recorded failure, if any task failed.
    pub fn join(&self) -> Result<(), GraphError> {
        self.wait_until(|state| state.unfinished == 0);

        let state = self.shared.state.lock();
        match state.first_failure {
            Some(root) => Err(state.failure_error(root)),
            None => Ok(()),
        }
    }

    /// Blocks until `handle` is terminal.
    ///
    /// Returns an error naming the root cause if the task failed or was
    /// abandoned.
    pub fn join_task(&self, handle: &TaskHandle) -> Result<(), GraphError> {
        {
            let state = self.shared.state.lock();
            if handle.0 >= state.nodes.len() {
                return Err(GraphError::UnknownDependency {
                    task: "join".to_string(),
                    handle: handle.0,
                });
            }
        }

        let target = *handle;
        self.wait_until(|state| state.node(target).status.is_terminal());

        let state = self.shared.state.lock();
        let node = state.node(target);
        match (node.status.is_success(), node.root_cause) {
            (true, _) => Ok(()),
            (false, Some(root)) => Err(state.failure_error(root)),
            (false, None) => Err(state.failure_error(target)),
        }
    }

    /// Waits for `done`, executing ready tasks inline in deferred mode.
    fn wait_until(&self, done: impl Fn(&GraphState) -> bool) {
        if self.worker_count == 0 {
            loop {
                let dispatch = {
                    let mut state = self.shared.state.lock();
                    if done(&state) {
                        return;
                    }
                    match state.dispatch_next() {
                        Some(dispatch) => dispatch,
                        // Unreachable for acyclic graphs; avoid spinning forever.
                        None => return,
                    }
                };
                let outcome = self.shared.run(&dispatch);
                self.shared.complete(dispatch, outcome);
            }
        }

        let mut state = self.shared.state.lock();
        while !done(&state) {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Returns the current status of a task.
    pub fn status(&self, handle: &TaskHandle) -> Option<TaskStatus> {
        self.shared
            .state
            .lock()
            .nodes
            .get(handle.0)
            .map(|n| n.status)
    }

    /// Returns the registered name of a task.
    pub fn task_name(&self, handle: &TaskHandle) -> Option<String> {
        self.shared
            .state
            .lock()
            .nodes
            .get(handle.0)
            .map(|n| n.name.clone())
    }

    /// Returns the name of the task that claims `target`, if any.
    pub fn target_owner(&self, target: &Path) -> Option<String> {
        let state = self.shared.state.lock();
        let owner = state.claimed_targets.get(target)?;
        Some(state.node(*owner).name.clone())
    }

    /// Returns the name of the task a failure originated from.
    pub fn root_cause(&self, handle: &TaskHandle) -> Option<String> {
        let state = self.shared.state.lock();
        let root = state.nodes.get(handle.0)?.root_cause?;
        Some(state.node(root).name.clone())
    }

    /// Returns the first failure recorded in this graph.
    pub fn first_failure(&self) -> Option<GraphError> {
        let state = self.shared.state.lock();
        state.first_failure.map(|root| state.failure_error(root))
    }

    /// Returns counts of tasks by outcome.
    pub fn stats(&self) -> GraphStats {
        self.shared.state.lock().stats()
    }

    /// Stops accepting tasks, waits for outstanding work, stops workers and
    /// flushes the ledger.
    ///
    /// Idempotent. Returns the first recorded failure, like [`join`](Self::join).
    pub fn close(&self) -> Result<(), GraphError> {
        let already_closed = std::mem::replace(&mut self.shared.state.lock().closed, true);
        let joined = self.join();

        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_available.notify_all();
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("Task graph worker panicked outside a task body");
            }
        }
        if !already_closed {
            let stats = self.stats();
            info!(
                executed = stats.executed,
                cached = stats.cached,
                failed = stats.failed,
                upstream_failed = stats.upstream_failed,
                "Task graph closed"
            );
        }

        self.shared.ledger.flush()?;
        joined
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("workspace", &self.workspace)
            .field("workers", &self.worker_count)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::task::TaskErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn writer(path: PathBuf) -> impl Fn() -> Result<(), TaskError> + Send + Sync + 'static {
        move || fs::write(&path, b"ok").map_err(|e| TaskError::new("write failed").with_source(e))
    }

    fn graph(dir: &TempDir, workers: usize) -> TaskGraph {
        TaskGraph::new(TaskGraphConfig::new(dir.path()).with_workers(workers)).unwrap()
    }

    #[test]
    fn test_linear_chain_runs_in_order() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut previous: Option<TaskHandle> = None;
        for i in 0..5 {
            let path = dir.path().join(format!("{}.txt", i));
            let order = Arc::clone(&order);
            let write = writer(path.clone());
            let mut spec = TaskSpec::new(format!("step{}", i), move || {
                order.lock().push(i);
                write()
            })
            .target(path);
            if let Some(prev) = &previous {
                spec = spec.depends_on(prev);
            }
            previous = Some(graph.add_task(spec).unwrap());
        }

        graph.join().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(graph.stats().executed, 5);
        graph.close().unwrap();
    }

    #[test]
    fn test_missing_targets_rejected() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 1);
        let err = graph.add_task(TaskSpec::new("bare", || Ok(()))).unwrap_err();
        assert!(matches!(err, GraphError::MissingTargets { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let path = dir.path().join("shared.tif");
        graph
            .add_task(TaskSpec::new("first", writer(path.clone())).target(&path))
            .unwrap();
        let err = graph
            .add_task(TaskSpec::new("second", writer(path.clone())).target(&path))
            .unwrap_err();
        match err {
            GraphError::DuplicateTarget { task, owner, .. } => {
                assert_eq!(task, "second");
                assert_eq!(owner, "first");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let err = graph
            .add_task(
                TaskSpec::new("orphan", || Ok(()))
                    .depends_on(&TaskHandle(42))
                    .target(dir.path().join("x")),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { handle: 42, .. }));
    }

    #[test]
    fn test_cycle_detected_at_registration() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let b_path = dir.path().join("b");
        let a_path = dir.path().join("a");
        let b = graph
            .add_task(TaskSpec::new("b", writer(b_path.clone())).target(&b_path))
            .unwrap();
        let a = graph
            .add_task(TaskSpec::new("a", writer(a_path.clone())).depends_on(&b).target(&a_path))
            .unwrap();

        let err = graph.add_dependency(&b, &a).unwrap_err();
        match err {
            GraphError::CycleDetected { path } => assert_eq!(path, vec!["b", "a", "b"]),
            other => panic!("unexpected error: {other}"),
        }

        let err = graph.add_dependency(&a, &a).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));

        // The graph remains usable and acyclic.
        graph.join().unwrap();
        assert_eq!(graph.status(&a), Some(TaskStatus::Succeeded));
    }

    #[test]
    fn test_add_dependency_defers_scheduled_task() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for name in ["first", "second"] {
            let path = dir.path().join(name);
            let order = Arc::clone(&order);
            let write = writer(path.clone());
            handles.push(
                graph
                    .add_task(
                        TaskSpec::new(name, move || {
                            order.lock().push(name);
                            write()
                        })
                        .target(path),
                    )
                    .unwrap(),
            );
        }

        // "first" was ready; make it wait for "second".
        graph.add_dependency(&handles[0], &handles[1]).unwrap();
        assert_eq!(graph.status(&handles[0]), Some(TaskStatus::Pending));

        graph.join().unwrap();
        assert_eq!(*order.lock(), vec!["second", "first"]);
    }

    #[test]
    fn test_add_dependency_after_dispatch_rejected() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let path = dir.path().join("done");
        let done = graph
            .add_task(TaskSpec::new("done", writer(path.clone())).target(&path))
            .unwrap();
        let other_path = dir.path().join("other");
        let other = graph
            .add_task(TaskSpec::new("other", writer(other_path.clone())).target(&other_path))
            .unwrap();
        graph.join_task(&done).unwrap();

        let err = graph.add_dependency(&done, &other).unwrap_err();
        assert!(matches!(err, GraphError::AlreadyDispatched { .. }));
    }

    #[test]
    fn test_failure_propagates_to_dependents_only() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 2);

        let bad = graph
            .add_task(
                TaskSpec::new("bad", || Err(TaskError::external("engine crashed")))
                    .target(dir.path().join("bad")),
            )
            .unwrap();
        let child = graph
            .add_task(
                TaskSpec::new("child", writer(dir.path().join("child")))
                    .depends_on(&bad)
                    .target(dir.path().join("child")),
            )
            .unwrap();
        let grandchild = graph
            .add_task(
                TaskSpec::new("grandchild", writer(dir.path().join("grandchild")))
                    .depends_on(&child)
                    .target(dir.path().join("grandchild")),
            )
            .unwrap();
        let independent = graph
            .add_task(
                TaskSpec::new("independent", writer(dir.path().join("independent")))
                    .target(dir.path().join("independent")),
            )
            .unwrap();

        let err = graph.join().unwrap_err();
        assert_eq!(err.failed_task(), Some("bad"));

        assert_eq!(graph.status(&bad), Some(TaskStatus::Failed));
        assert_eq!(graph.status(&child), Some(TaskStatus::UpstreamFailed));
        assert_eq!(graph.status(&grandchild), Some(TaskStatus::UpstreamFailed));
        assert_eq!(graph.status(&independent), Some(TaskStatus::Succeeded));
        assert_eq!(graph.root_cause(&grandchild).as_deref(), Some("bad"));
        assert!(!dir.path().join("grandchild").exists());

        let err = graph.join_task(&grandchild).unwrap_err();
        assert_eq!(err.failed_task(), Some("bad"));
        assert!(graph.join_task(&independent).is_ok());
    }

    #[test]
    fn test_registering_behind_failed_task() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 1);
        let bad = graph
            .add_task(TaskSpec::new("bad", || Err(TaskError::new("boom"))).target(dir.path().join("bad")))
            .unwrap();
        let _ = graph.join();

        let late_path = dir.path().join("late");
        fs::write(&late_path, b"stale").unwrap();
        let late = graph
            .add_task(TaskSpec::new("late", writer(late_path.clone())).depends_on(&bad).target(&late_path))
            .unwrap();
        assert_eq!(graph.status(&late), Some(TaskStatus::UpstreamFailed));
        assert!(!late_path.exists());
    }

    #[test]
    fn test_late_dependency_on_failed_task_keeps_root_cause() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let bad = graph
            .add_task(TaskSpec::new("bad", || Err(TaskError::new("boom"))).target(dir.path().join("bad")))
            .unwrap();
        assert!(graph.join_task(&bad).is_err());

        let a_path = dir.path().join("a");
        let b_path = dir.path().join("b");
        let a = graph.add_task(TaskSpec::new("a", writer(a_path.clone())).target(&a_path)).unwrap();
        let b = graph
            .add_task(TaskSpec::new("b", writer(b_path.clone())).depends_on(&a).target(&b_path))
            .unwrap();
        graph.add_dependency(&a, &bad).unwrap();

        assert_eq!(graph.status(&a), Some(TaskStatus::UpstreamFailed));
        assert_eq!(graph.status(&b), Some(TaskStatus::UpstreamFailed));
        assert_eq!(graph.root_cause(&a).as_deref(), Some("bad"));
        assert_eq!(graph.root_cause(&b).as_deref(), Some("bad"));
        let err = graph.join_task(&b).unwrap_err();
        assert_eq!(err.failed_task(), Some("bad"));
        assert!(!b_path.exists());
    }

    #[test]
    fn test_missing_artifact_fails_task() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 1);
        let liar = graph
            .add_task(TaskSpec::new("liar", || Ok(())).target(dir.path().join("never")))
            .unwrap();

        let err = graph.join().unwrap_err();
        assert_eq!(graph.status(&liar), Some(TaskStatus::Failed));
        match err {
            GraphError::TaskFailed { error, .. } => {
                assert_eq!(error.kind(), TaskErrorKind::ArtifactMissing)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 1);
        graph
            .add_task(
                TaskSpec::new("panics", || -> Result<(), TaskError> { panic!("kaboom") })
                    .target(dir.path().join("p")),
            )
            .unwrap();
        let ok_path = dir.path().join("ok");
        let ok = graph
            .add_task(TaskSpec::new("ok", writer(ok_path.clone())).target(&ok_path))
            .unwrap();

        let err = graph.join().unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert_eq!(graph.status(&ok), Some(TaskStatus::Succeeded));
    }

    #[test]
    fn test_deferred_mode_runs_on_join() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let path = dir.path().join("lazy");
        let counter = Arc::clone(&runs);
        let write = writer(path.clone());
        let handle = graph
            .add_task(
                TaskSpec::new("lazy", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    write()
                })
                .target(&path),
            )
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(graph.status(&handle), Some(TaskStatus::Scheduled));
        graph.join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_new_tasks() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 2);
        let path = dir.path().join("one");
        graph
            .add_task(TaskSpec::new("one", writer(path.clone())).target(&path))
            .unwrap();

        graph.close().unwrap();
        graph.close().unwrap();
        assert!(path.exists());
        assert!(dir.path().join(LEDGER_FILE_NAME).exists());

        let err = graph
            .add_task(TaskSpec::new("two", || Ok(())).target(dir.path().join("two")))
            .unwrap_err();
        assert!(matches!(err, GraphError::Closed));
    }

    #[test]
    fn test_close_reports_failure() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir, 1);
        graph
            .add_task(TaskSpec::new("bad", || Err(TaskError::new("boom"))).target(dir.path().join("bad")))
            .unwrap();
        let err = graph.close().unwrap_err();
        assert_eq!(err.failed_task(), Some("bad"));
        assert!(graph.first_failure().is_some());
    }
}
