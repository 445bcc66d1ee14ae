//! Global injection queue.
//!
//! A thread-safe unbounded FIFO for tasks submitted from outside a worker,
//! for fair (yielding) submissions, and for batches a worker spills.

use super::Task;
use crossbeam_queue::SegQueue;
use std::fmt;

/// A global task queue.
#[derive(Default)]
pub struct GlobalQueue {
    inner: SegQueue<Task>,
}

impl GlobalQueue {
    /// Creates a new global queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Pushes a task to the back of the queue.
    pub fn push(&self, task: Task) {
        self.inner.push(task);
    }

    /// Pops the oldest task.
    pub fn pop(&self) -> Option<Task> {
        self.inner.pop()
    }

    /// Returns the number of tasks in the queue.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for GlobalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalQueue")
            .field("len", &self.len())
            .finish()
    }
}
