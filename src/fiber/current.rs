//! Thread-local record of the fiber being interpreted.
//!
//! Set when a fiber loop starts on a thread and restored when it returns,
//! so an eagerly started child nested inside its parent's step reports
//! itself and then hands the slot back.

use crate::types::FiberId;
use std::cell::Cell;

thread_local! {
    static CURRENT: Cell<Option<FiberId>> = const { Cell::new(None) };
}

/// The fiber running on this thread, when the runtime tracks it.
#[must_use]
pub fn current_fiber_id() -> Option<FiberId> {
    CURRENT.with(Cell::get)
}

/// Restores the previous current fiber on drop.
pub(crate) struct CurrentGuard {
    previous: Option<Option<FiberId>>,
}

pub(crate) fn enter(id: FiberId, enabled: bool) -> CurrentGuard {
    if !enabled {
        return CurrentGuard { previous: None };
    }
    let previous = CURRENT.with(|current| current.replace(Some(id)));
    CurrentGuard {
        previous: Some(previous),
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            CURRENT.with(|current| current.set(previous));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_nests_and_restores() {
        let outer = FiberId::new_for_test(1);
        let inner = FiberId::new_for_test(2);
        {
            let _a = enter(outer, true);
            assert_eq!(current_fiber_id(), Some(outer));
            {
                let _b = enter(inner, true);
                assert_eq!(current_fiber_id(), Some(inner));
            }
            assert_eq!(current_fiber_id(), Some(outer));
        }
        assert_eq!(current_fiber_id(), None);
    }

    #[test]
    fn disabled_guard_is_inert() {
        let _guard = enter(FiberId::new_for_test(3), false);
        assert_eq!(current_fiber_id(), None);
    }
}
