//! Fiber scheduling.
//!
//! The interpreter never blocks a thread on a fiber. Whenever a fiber must
//! continue later (it was resumed from an async boundary, it was forked past
//! the eager-start depth, or it used up its operation budget) the loop hands
//! a [`Task`] to the runtime's [`Scheduler`].
//!
//! - [`global_queue`]: the shared FIFO injection queue
//! - [`worker`]: the default [`WorkerPool`] and its [`Parker`]

pub mod global_queue;
pub mod worker;

pub use global_queue::GlobalQueue;
pub use worker::{Parker, WorkerPool};

/// A unit of work: one slice of a fiber's loop.
pub type Task = Box<dyn FnOnce() + Send>;

/// Executes fiber slices.
pub trait Scheduler: Send + Sync {
    /// Submits a task. Tasks submitted from a thread the scheduler is
    /// already running may be batched behind the current task.
    fn schedule_task(&self, task: Task);

    /// Submits a task behind all work already queued. Used when a fiber
    /// yields, so that it cannot starve its peers.
    fn schedule_fair(&self, task: Task);
}
