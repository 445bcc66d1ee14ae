//! Continuation stack and the rest of a fiber's run state.
//!
//! Everything here is owned by whichever thread is currently interpreting the
//! fiber. While the fiber is suspended the [`RunState`] is parked on the
//! fiber context and handed to whoever resumes it.

use crate::effect::instr::{CauseCont, Cont, ExitCont};
use crate::fiber::scope::ForkScope;
use crate::supervisor::Supervisor;
use crate::types::trace::TraceRing;
use crate::types::{FiberId, Trace};
use smallvec::SmallVec;
use std::panic::Location;
use std::sync::Arc;

/// A continuation frame.
pub(crate) enum Frame {
    /// Continue with the success value; failures skip it.
    Apply(Cont),
    /// Handle either outcome.
    Fold {
        on_failure: CauseCont,
        on_success: Cont,
    },
    /// Run on any exit, uninterruptibly, then resume that exit.
    Finalizer(ExitCont),
    /// Leave an `InterruptStatus` region.
    InterruptExit,
    /// Leave a `Supervise` region.
    SupervisorExit,
    /// Leave an `OverrideForkScope` region.
    ForkScopeExit,
}

/// Handler found while unwinding a failure.
pub(crate) enum Handler {
    Fold(CauseCont),
    Finalizer(ExitCont),
}

/// Result of unwinding the stack for a failure.
pub(crate) struct Unwind {
    /// Some fold frame was skipped because the fiber is being interrupted.
    pub(crate) discarded_folds: bool,
    /// The frame that takes over, or `None` when the stack ran empty.
    pub(crate) handler: Option<Handler>,
}

/// Per-fiber interpreter state, owned by the thread running the fiber.
#[derive(Default)]
pub(crate) struct RunState {
    pub(crate) stack: Vec<Frame>,
    pub(crate) interrupt_status: SmallVec<[bool; 8]>,
    pub(crate) supervisors: Vec<Arc<dyn Supervisor>>,
    pub(crate) fork_scopes: Vec<Option<Arc<dyn ForkScope>>>,
    pub(crate) trace: TraceRing,
    pub(crate) async_epoch: u64,
    pub(crate) mailbox_drains: usize,
}

impl RunState {
    pub(crate) fn new(
        interruptible: bool,
        supervisors: Vec<Arc<dyn Supervisor>>,
        trace_depth: usize,
    ) -> Self {
        let mut interrupt_status = SmallVec::new();
        interrupt_status.push(interruptible);
        Self {
            stack: Vec::new(),
            interrupt_status,
            supervisors,
            fork_scopes: Vec::new(),
            trace: TraceRing::new(trace_depth),
            async_epoch: 0,
            mailbox_drains: 0,
        }
    }

    pub(crate) fn is_interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }

    pub(crate) fn push_interrupt_status(&mut self, interruptible: bool) {
        self.interrupt_status.push(interruptible);
        self.stack.push(Frame::InterruptExit);
    }

    /// Restores the status saved by the matching [`Frame::InterruptExit`].
    pub(crate) fn pop_interrupt_status(&mut self) {
        if self.interrupt_status.len() > 1 {
            self.interrupt_status.pop();
        }
    }

    pub(crate) fn fork_scope_override(&self) -> Option<Arc<dyn ForkScope>> {
        self.fork_scopes.last().cloned().flatten()
    }

    pub(crate) fn record(&mut self, location: &'static Location<'static>) {
        self.trace.record(location);
    }

    pub(crate) fn capture_trace(&self, fiber_id: FiberId) -> Option<Trace> {
        self.trace.snapshot(fiber_id)
    }

    /// Pops frames looking for something that takes over a failure.
    ///
    /// Exit frames restore their region as they are popped. A fold frame is
    /// honoured only while `should_interrupt` is false; otherwise it is
    /// discarded and the caller must strip typed failures, whose handler is
    /// gone. Finalizer frames always stop the unwind.
    pub(crate) fn unwind(&mut self, should_interrupt: impl Fn(&Self) -> bool) -> Unwind {
        let mut discarded_folds = false;
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::InterruptExit => self.pop_interrupt_status(),
                Frame::SupervisorExit => {
                    self.supervisors.pop();
                }
                Frame::ForkScopeExit => {
                    self.fork_scopes.pop();
                }
                Frame::Apply(_) => {}
                Frame::Fold { on_failure, .. } => {
                    if should_interrupt(self) {
                        discarded_folds = true;
                    } else {
                        return Unwind {
                            discarded_folds,
                            handler: Some(Handler::Fold(on_failure)),
                        };
                    }
                }
                Frame::Finalizer(fin) => {
                    return Unwind {
                        discarded_folds,
                        handler: Some(Handler::Finalizer(fin)),
                    };
                }
            }
        }
        Unwind {
            discarded_folds,
            handler: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::instr::Instr;

    fn fold() -> Frame {
        Frame::Fold {
            on_failure: Box::new(Instr::fail_cause),
            on_success: Box::new(Instr::SucceedNow),
        }
    }

    #[test]
    fn unwind_stops_at_fold() {
        let mut rs = RunState::new(true, Vec::new(), 0);
        rs.stack.push(fold());
        rs.stack.push(Frame::Apply(Box::new(Instr::SucceedNow)));
        let unwind = rs.unwind(|_| false);
        assert!(!unwind.discarded_folds);
        assert!(matches!(unwind.handler, Some(Handler::Fold(_))));
        assert!(rs.stack.is_empty());
    }

    #[test]
    fn unwind_discards_folds_while_interrupting() {
        let mut rs = RunState::new(true, Vec::new(), 0);
        rs.stack.push(fold());
        let unwind = rs.unwind(RunState::is_interruptible);
        assert!(unwind.discarded_folds);
        assert!(unwind.handler.is_none());
    }

    #[test]
    fn unwind_restores_interrupt_status() {
        let mut rs = RunState::new(true, Vec::new(), 0);
        rs.stack.push(fold());
        rs.push_interrupt_status(false);
        assert!(!rs.is_interruptible());
        // Uninterruptible region: the fold survives until the exit frame pops.
        let unwind = rs.unwind(RunState::is_interruptible);
        assert!(rs.is_interruptible());
        assert!(unwind.discarded_folds);
    }

    #[test]
    fn finalizer_always_stops_unwind() {
        let mut rs = RunState::new(true, Vec::new(), 0);
        rs.stack.push(Frame::Finalizer(Box::new(|_| Instr::unit())));
        let unwind = rs.unwind(|_| true);
        assert!(matches!(unwind.handler, Some(Handler::Finalizer(_))));
    }

    #[test]
    fn base_status_is_never_popped() {
        let mut rs = RunState::new(false, Vec::new(), 0);
        rs.pop_interrupt_status();
        assert!(!rs.is_interruptible());
    }
}
