//! Fork scopes: where newly forked fibers are attached.
//!
//! A scope decides which fiber (if any) supervises a child's lifetime. A
//! fiber that completes interrupts every child still attached to it, so the
//! default local scope gives structured concurrency. Forking into the global
//! scope produces a daemon that outlives its parent.

use crate::fiber::context::FiberContext;
use crate::fiber::handle::RuntimeFiber;
use crate::runtime::RuntimeConfig;
use crate::types::FiberId;
use std::fmt;
use std::sync::{Arc, Weak};

/// A registry that newly forked fibers are attached to.
pub trait ForkScope: Send + Sync {
    /// The fiber owning this scope, or [`FiberId::NONE`] for scopes not tied
    /// to a fiber. A child rejected by the scope is interrupted by this id.
    fn fiber_id(&self) -> FiberId;

    /// Attaches `child`. Returning false means the scope is already closed;
    /// the child is then interrupted instead of started.
    fn add(&self, config: &RuntimeConfig, child: &RuntimeFiber) -> bool;
}

/// The root scope. Children attached here are daemons.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalScope;

impl ForkScope for GlobalScope {
    fn fiber_id(&self) -> FiberId {
        FiberId::NONE
    }

    fn add(&self, _config: &RuntimeConfig, _child: &RuntimeFiber) -> bool {
        true
    }
}

/// The scope of one running fiber.
pub(crate) struct LocalScope {
    id: FiberId,
    parent: Weak<FiberContext>,
}

impl LocalScope {
    pub(crate) fn new(parent: &Arc<FiberContext>) -> Self {
        Self {
            id: parent.id(),
            parent: Arc::downgrade(parent),
        }
    }
}

impl fmt::Debug for LocalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalScope({})", self.id)
    }
}

impl ForkScope for LocalScope {
    fn fiber_id(&self) -> FiberId {
        self.id
    }

    fn add(&self, _config: &RuntimeConfig, child: &RuntimeFiber) -> bool {
        let Some(parent) = self.parent.upgrade() else {
            return false;
        };
        if parent.add_child(child.context()) {
            child.context().set_parent(Weak::clone(&self.parent));
            true
        } else {
            false
        }
    }
}
