//! Fiber identifiers.
//!
//! Every fiber receives a process-unique [`FiberId`] when its context is
//! created. Ids are allocated from a monotonically increasing counter, so a
//! smaller id always belongs to an older fiber. [`FiberId::NONE`] is reserved
//! for "no fiber", e.g. an interruption raised from outside the runtime.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a fiber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// The id used when an interruption or scope has no owning fiber.
    pub const NONE: Self = Self(0);

    /// Allocates a fresh fiber id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a fiber id with a fixed value for tests.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for [`FiberId::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
