//! Fiber lifecycle status.

use crate::effect::instr::Instr;
use crate::types::{FiberId, Trace};

/// Where a fiber is in its lifecycle.
///
/// `Suspended` keeps the status it replaced in `previous`, forming a chain
/// that is unwound one layer per resumption. The `interrupting` flag lives
/// at the bottom of that chain; the accessors below recurse to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Interpreting instructions.
    Running {
        /// The fiber is already unwinding because of an interruption.
        interrupting: bool,
    },
    /// Waiting for an external callback.
    Suspended {
        /// The status the fiber had before suspending.
        previous: Box<FiberStatus>,
        /// Whether an interruption may cancel the suspension.
        interruptible: bool,
        /// The fiber (if any) this one is waiting on.
        blocking_on: FiberId,
        /// Identifies this suspension; resumes from other epochs are ignored.
        epoch: u64,
        /// Where the fiber suspended.
        trace: Option<Trace>,
    },
    /// Interrupting children before completing.
    Finishing {
        /// The fiber is already unwinding because of an interruption.
        interrupting: bool,
    },
    /// Completed.
    Done,
}

impl FiberStatus {
    /// The status of a freshly created fiber.
    #[must_use]
    pub const fn initial() -> Self {
        Self::Running {
            interrupting: false,
        }
    }

    /// True when the fiber is unwinding because of an interruption.
    #[must_use]
    pub fn is_interrupting(&self) -> bool {
        match self {
            Self::Running { interrupting } | Self::Finishing { interrupting } => *interrupting,
            Self::Suspended { previous, .. } => previous.is_interrupting(),
            Self::Done => false,
        }
    }

    /// Copy of this status with the interrupting flag replaced.
    #[must_use]
    pub fn with_interrupting(self, interrupting: bool) -> Self {
        match self {
            Self::Running { .. } => Self::Running { interrupting },
            Self::Finishing { .. } => Self::Finishing { interrupting },
            Self::Suspended {
                previous,
                interruptible,
                blocking_on,
                epoch,
                trace,
            } => Self::Suspended {
                previous: Box::new(previous.with_interrupting(interrupting)),
                interruptible,
                blocking_on,
                epoch,
                trace,
            },
            Self::Done => Self::Done,
        }
    }

    /// Copy of this status moved to the finishing phase.
    #[must_use]
    pub fn to_finishing(self) -> Self {
        match self {
            Self::Running { interrupting } | Self::Finishing { interrupting } => {
                Self::Finishing { interrupting }
            }
            Self::Suspended { previous, .. } => previous.to_finishing(),
            Self::Done => Self::Done,
        }
    }

    /// True while suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// True once completed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Cancellation state of the fiber's current async boundary.
///
/// `Empty -> Pending` when entering the boundary, `Pending -> Registered`
/// once the registration callback hands back its canceler, and back to
/// `Empty` on resume. Registering twice is a fatal error.
pub(crate) enum CancelerState {
    Empty,
    Pending,
    Registered(Instr),
}

impl CancelerState {
    pub(crate) const fn is_registered(&self) -> bool {
        matches!(self, Self::Registered(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suspended(previous: FiberStatus) -> FiberStatus {
        FiberStatus::Suspended {
            previous: Box::new(previous),
            interruptible: true,
            blocking_on: FiberId::NONE,
            epoch: 0,
            trace: None,
        }
    }

    #[test]
    fn interrupting_recurses_through_suspension() {
        let status = suspended(suspended(FiberStatus::Running { interrupting: true }));
        assert!(status.is_interrupting());
        let cleared = status.with_interrupting(false);
        assert!(!cleared.is_interrupting());
        assert!(cleared.is_suspended());
    }

    #[test]
    fn finishing_unwinds_suspension_layers() {
        let status = suspended(FiberStatus::Running { interrupting: true });
        assert_eq!(
            status.to_finishing(),
            FiberStatus::Finishing { interrupting: true }
        );
    }

    #[test]
    fn initial_and_done() {
        assert!(!FiberStatus::initial().is_interrupting());
        assert!(FiberStatus::Done.is_done());
        assert!(!FiberStatus::Done.with_interrupting(true).is_interrupting());
    }
}
