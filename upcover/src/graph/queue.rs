//! Ready queue for task dispatch.
//!
//! Tasks whose dependencies have all succeeded wait here for a worker. The
//! queue hands them out in registration order (FIFO among ready tasks);
//! there is no priority beyond topological readiness.
//!
//! # Example
//!
//! ```ignore
//! let mut queue = ReadyQueue::new();
//! queue.push(ReadyTask::new(TaskHandle(4)));
//! queue.push(ReadyTask::new(TaskHandle(1)));
//!
//! // Earlier registration comes out first despite being pushed second
//! assert_eq!(queue.pop().unwrap().handle, TaskHandle(1));
//! ```

use super::task::TaskHandle;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// A task waiting for a worker.
#[derive(Debug)]
pub struct ReadyTask {
    /// The task to dispatch. Its index doubles as the registration sequence.
    pub handle: TaskHandle,

    /// When the task became ready (for wait time logging).
    pub enqueued_at: Instant,
}

impl ReadyTask {
    /// Creates a ready entry stamped with the current time.
    pub fn new(handle: TaskHandle) -> Self {
        Self {
            handle,
            enqueued_at: Instant::now(),
        }
    }

    /// Returns how long this task has been waiting in the queue.
    pub fn wait_time(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the lowest registration index must win.
        other.handle.cmp(&self.handle)
    }
}

/// FIFO-by-registration queue of ready tasks.
///
/// The queue is not thread-safe; the graph keeps it inside its state mutex.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
}

impl ReadyQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the queue.
    pub fn push(&mut self, task: ReadyTask) {
        self.heap.push(task);
    }

    /// Removes and returns the earliest-registered ready task.
    pub fn pop(&mut self) -> Option<ReadyTask> {
        self.heap.pop()
    }

    /// Returns the next task without removing it.
    pub fn peek(&self) -> Option<&ReadyTask> {
        self.heap.peek()
    }

    /// Removes a specific task, returning true if it was queued.
    ///
    /// Used when a queued task gains a new dependency or is abandoned
    /// because an upstream task failed.
    pub fn remove(&mut self, handle: TaskHandle) -> bool {
        let before = self.heap.len();
        self.heap.retain(|t| t.handle != handle);
        before != self.heap.len()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
