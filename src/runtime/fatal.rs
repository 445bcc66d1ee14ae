//! Process-wide catastrophic failure flag.
//!
//! Set the first time any runtime reports a [`FatalError`](crate::error::FatalError).
//! Once set it stays set: a fatal error means an engine invariant broke and
//! nothing the process does afterwards can be fully trusted.

use std::sync::atomic::{AtomicBool, Ordering};

static CATASTROPHIC: AtomicBool = AtomicBool::new(false);

/// True once any fiber in the process reported a fatal error.
#[must_use]
pub fn catastrophic_failure() -> bool {
    CATASTROPHIC.load(Ordering::Acquire)
}

pub(crate) fn mark_catastrophic() {
    CATASTROPHIC.store(true, Ordering::Release);
}
