//! Fiber lifecycle supervision.
//!
//! A [`Supervisor`] observes fibers as they start, run, suspend and end.
//! Supervisors are attached either runtime-wide through
//! [`RuntimeConfig::supervisor`](crate::runtime::RuntimeConfig) or to a
//! region of a program with [`Effect::supervised`](crate::Effect::supervised);
//! children forked inside a supervised region inherit its supervisors.
//!
//! Hooks run on the fiber's own thread while it is being interpreted, so
//! they must be cheap. A hook that panics is reported as a fatal error and
//! the fiber carries on.
//!
//! ```rust,ignore
//! let track = Arc::new(Track::new());
//! let program = work.supervised(track.clone());
//! // ... later
//! assert!(track.live().is_empty());
//! ```

use crate::effect::InstrKind;
use crate::fiber::RuntimeFiber;
use crate::fiber_ref::FiberRefs;
use crate::types::{AnyExit, FiberId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Observer of fiber lifecycle events. Every hook defaults to a no-op.
pub trait Supervisor: Send + Sync {
    /// A fiber was created. `parent` is `None` for root fibers.
    fn on_start(&self, _refs: &FiberRefs, _parent: Option<FiberId>, _fiber: &RuntimeFiber) {}

    /// A fiber completed with `exit`.
    fn on_end(&self, _exit: &AnyExit, _fiber: &RuntimeFiber) {}

    /// A fiber's interpreter loop (re)started on a thread.
    fn on_resume(&self, _fiber: FiberId) {}

    /// A fiber suspended on an async boundary.
    fn on_suspend(&self, _fiber: FiberId) {}

    /// A fiber is about to evaluate an instruction.
    fn on_effect(&self, _fiber: FiberId, _kind: InstrKind) {}
}

/// Keeps every started fiber until it ends.
#[derive(Default)]
pub struct Track {
    live: Mutex<HashMap<FiberId, RuntimeFiber>>,
}

impl Track {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fibers started and not yet ended, in id order.
    #[must_use]
    pub fn live(&self) -> Vec<RuntimeFiber> {
        let mut fibers: Vec<_> = self.live.lock().values().cloned().collect();
        fibers.sort_by_key(RuntimeFiber::id);
        fibers
    }

    /// Number of live fibers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// True when no tracked fiber is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track").field("live", &self.len()).finish()
    }
}

impl Supervisor for Track {
    fn on_start(&self, _refs: &FiberRefs, _parent: Option<FiberId>, fiber: &RuntimeFiber) {
        self.live.lock().insert(fiber.id(), fiber.clone());
    }

    fn on_end(&self, _exit: &AnyExit, fiber: &RuntimeFiber) {
        self.live.lock().remove(&fiber.id());
    }
}
