//! Fibers: the engine's unit of concurrent execution.
//!
//! - [`status`]: lifecycle status and the async canceler sub-state
//! - [`state`]: the shared state record and its transitions
//! - [`stack`]: the continuation and interrupt-status stacks
//! - [`context`]: the interpreter loop
//! - [`handle`]: typed and erased fiber handles
//! - [`scope`]: fork scopes
//! - [`current`]: the thread-local current fiber
//! - [`signal`]: control-flow escapes out of user code

pub(crate) mod context;
pub mod current;
pub mod handle;
pub mod scope;
pub mod signal;
pub(crate) mod stack;
pub(crate) mod state;
pub mod status;

pub use current::current_fiber_id;
pub use handle::{Fiber, RuntimeFiber};
pub use scope::{ForkScope, GlobalScope};
pub use signal::{exit_early, interrupt_current};
pub use status::FiberStatus;

use crate::types::FiberId;
use std::collections::BTreeSet;

/// A point-in-time description of the running fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// The fiber's identity.
    pub id: FiberId,
    /// Lifecycle status when the descriptor was taken.
    pub status: FiberStatus,
    /// Fibers that have asked this one to stop.
    pub interruptors: BTreeSet<FiberId>,
    /// Whether the fiber was interruptible at that point.
    pub interruptible: bool,
    /// The fiber owning the scope this fiber was forked into.
    pub scope_id: FiberId,
}
