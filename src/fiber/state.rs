//! The shared state record of one fiber and every transition on it.
//!
//! The record lives behind one `parking_lot::Mutex` on the fiber context.
//! Each method here is one atomic transition; callers hold the lock only for
//! the duration of the call and never run user code or touch another fiber
//! while holding it. Work that must happen after a transition (running a
//! canceler, notifying observers) is handed back to the caller.

use crate::effect::instr::Instr;
use crate::error::FatalError;
use crate::fiber::context::FiberContext;
use crate::fiber::status::{CancelerState, FiberStatus};
use crate::types::{AnyCause, AnyExit, Cause, FiberId, Trace};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;

/// A completion callback.
pub(crate) type Observer = Box<dyn FnOnce(AnyExit) + Send>;

/// Lifecycle record: still running, or finished with an exit.
pub(crate) enum FiberState {
    Executing(Executing),
    Done(AnyExit),
}

/// State of a fiber that has not completed.
pub(crate) struct Executing {
    pub(crate) status: FiberStatus,
    pub(crate) observers: Vec<(u64, Observer)>,
    pub(crate) next_observer_id: u64,
    pub(crate) suppressed: AnyCause,
    pub(crate) interruptors: BTreeSet<FiberId>,
    pub(crate) canceler: CancelerState,
    pub(crate) mailbox: Option<Instr>,
    pub(crate) children: BTreeMap<FiberId, Arc<FiberContext>>,
}

/// Outcome of handing a canceler to a suspended fiber.
pub(crate) enum CancelerOutcome {
    /// Stored; an interruptor may now run it.
    Registered,
    /// The suspension already ended; the canceler is dropped.
    Stale,
    /// An interruption arrived during registration. The fiber has left the
    /// suspension and must continue with this instruction.
    InterruptNow(Instr),
}

/// What an interruption signal requires of the caller.
pub(crate) enum InterruptAction {
    /// Recorded; the fiber notices at its next step.
    Recorded,
    /// The fiber was suspended with a registered canceler and has been
    /// taken out of its suspension. The caller must resume it with this
    /// instruction.
    Resume(Instr),
    /// The fiber is done.
    Ignored,
}

/// Result of trying to complete a fiber.
pub(crate) enum Completion {
    /// Mail arrived; run it and try again.
    Drain(Instr),
    /// Mail arrived past the drain limit and was dropped.
    Discarded(Instr),
    /// Children remain; interrupt them and try again.
    Children(Vec<Arc<FiberContext>>),
    /// The fiber is now done.
    Done {
        exit: AnyExit,
        observers: Vec<Observer>,
    },
    /// The fiber had already completed.
    AlreadyDone,
}

impl Executing {
    fn new() -> Self {
        Self {
            status: FiberStatus::initial(),
            observers: Vec::new(),
            next_observer_id: 0,
            suppressed: Cause::Empty,
            interruptors: BTreeSet::new(),
            canceler: CancelerState::Empty,
            mailbox: None,
            children: BTreeMap::new(),
        }
    }

    fn interruptors_cause(&self) -> AnyCause {
        Cause::interrupted_by(self.interruptors.iter().copied())
    }

    /// Unwinds one suspension layer and clears the canceler.
    fn leave_suspension(&mut self, interrupting: Option<bool>) {
        let status = mem::replace(&mut self.status, FiberStatus::initial());
        let status = match status {
            FiberStatus::Suspended { previous, .. } => *previous,
            other => other,
        };
        self.status = match interrupting {
            Some(flag) => status.with_interrupting(flag),
            None => status,
        };
        self.canceler = CancelerState::Empty;
    }

    fn suspended_epoch(&self) -> Option<(u64, bool)> {
        match &self.status {
            FiberStatus::Suspended {
                epoch,
                interruptible,
                ..
            } => Some((*epoch, *interruptible)),
            _ => None,
        }
    }
}

impl FiberState {
    pub(crate) fn new() -> Self {
        Self::Executing(Executing::new())
    }

    fn executing(&mut self) -> Option<&mut Executing> {
        match self {
            Self::Executing(exec) => Some(exec),
            Self::Done(_) => None,
        }
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match self {
            Self::Executing(exec) => exec.status.clone(),
            Self::Done(_) => FiberStatus::Done,
        }
    }

    pub(crate) fn exit(&self) -> Option<AnyExit> {
        match self {
            Self::Executing(_) => None,
            Self::Done(exit) => Some(exit.clone()),
        }
    }

    pub(crate) fn interruptors(&self) -> BTreeSet<FiberId> {
        match self {
            Self::Executing(exec) => exec.interruptors.clone(),
            Self::Done(_) => BTreeSet::new(),
        }
    }

    /// Interrupted, and not already unwinding because of it.
    pub(crate) fn is_interrupt_pending(&self) -> bool {
        match self {
            Self::Executing(exec) => {
                !exec.interruptors.is_empty() && !exec.status.is_interrupting()
            }
            Self::Done(_) => false,
        }
    }

    pub(crate) fn set_interrupting(&mut self, interrupting: bool) {
        if let Some(exec) = self.executing() {
            let status = mem::replace(&mut exec.status, FiberStatus::initial());
            exec.status = status.with_interrupting(interrupting);
        }
    }

    pub(crate) fn clear_suppressed(&mut self) -> AnyCause {
        self.executing()
            .map_or(Cause::Empty, |exec| mem::replace(&mut exec.suppressed, Cause::Empty))
    }

    /// Checks for a pending interruption at the top of a step.
    ///
    /// When one is due the fiber is marked interrupting and the returned
    /// cause replaces the current instruction: the suppressed cause, or the
    /// interruptors when nothing was suppressed. Otherwise any mailbox
    /// content is handed back for sequencing.
    pub(crate) fn poll_pending(&mut self, interruptible: bool) -> Pending {
        let Some(exec) = self.executing() else {
            return Pending::None;
        };
        if interruptible && !exec.interruptors.is_empty() && !exec.status.is_interrupting() {
            let status = mem::replace(&mut exec.status, FiberStatus::initial());
            exec.status = status.with_interrupting(true);
            let suppressed = mem::replace(&mut exec.suppressed, Cause::Empty);
            let cause = if suppressed.is_empty() {
                exec.interruptors_cause()
            } else {
                suppressed
            };
            return Pending::Interrupt(cause);
        }
        exec.mailbox.take().map_or(Pending::None, Pending::Mail)
    }

    pub(crate) fn enter_async(
        &mut self,
        epoch: u64,
        interruptible: bool,
        blocking_on: FiberId,
        trace: Option<Trace>,
    ) {
        if let Some(exec) = self.executing() {
            let previous = mem::replace(&mut exec.status, FiberStatus::initial());
            let interruptible = interruptible && !previous.is_interrupting();
            exec.status = FiberStatus::Suspended {
                previous: Box::new(previous),
                interruptible,
                blocking_on,
                epoch,
                trace,
            };
            exec.canceler = CancelerState::Pending;
        }
    }

    /// Leaves the suspension identified by `epoch`. Exactly one caller per
    /// suspension gets `true`; that caller owns the parked run state.
    pub(crate) fn exit_async(&mut self, epoch: u64) -> bool {
        let Some(exec) = self.executing() else {
            return false;
        };
        match exec.suspended_epoch() {
            Some((current, _)) if current == epoch => {
                exec.leave_suspension(None);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_async_canceler(
        &mut self,
        fiber_id: FiberId,
        epoch: u64,
        canceler: Instr,
    ) -> Result<CancelerOutcome, FatalError> {
        let Some(exec) = self.executing() else {
            return Ok(CancelerOutcome::Stale);
        };
        let interruptible = match exec.suspended_epoch() {
            Some((current, interruptible)) if current == epoch => interruptible,
            _ => return Ok(CancelerOutcome::Stale),
        };
        if exec.canceler.is_registered() {
            return Err(FatalError::DoubleCancelerRegistration { fiber_id });
        }
        if interruptible && !exec.interruptors.is_empty() && !exec.status.is_interrupting() {
            let cause = exec.interruptors_cause();
            exec.leave_suspension(Some(true));
            return Ok(CancelerOutcome::InterruptNow(
                canceler.then(Instr::fail_cause(cause)),
            ));
        }
        exec.canceler = CancelerState::Registered(canceler);
        Ok(CancelerOutcome::Registered)
    }

    /// Records an interruption by `by`.
    pub(crate) fn interrupt(&mut self, by: FiberId) -> InterruptAction {
        let Some(exec) = self.executing() else {
            return InterruptAction::Ignored;
        };
        exec.interruptors.insert(by);
        let cancelable = matches!(
            (&exec.status, &exec.canceler),
            (
                FiberStatus::Suspended {
                    interruptible: true,
                    ..
                },
                CancelerState::Registered(_)
            )
        );
        if cancelable {
            if let CancelerState::Registered(canceler) =
                mem::replace(&mut exec.canceler, CancelerState::Empty)
            {
                exec.leave_suspension(Some(true));
                return InterruptAction::Resume(
                    canceler.then(Instr::fail_cause(Cause::interrupt(by))),
                );
            }
        }
        let suppressed = mem::replace(&mut exec.suppressed, Cause::Empty);
        exec.suppressed = suppressed.then(Cause::interrupt(by));
        InterruptAction::Recorded
    }

    /// Registers a completion callback. A done fiber hands the callback back
    /// together with its exit so the caller can invoke it outside the lock.
    pub(crate) fn add_observer(&mut self, observer: Observer) -> Result<u64, (Observer, AnyExit)> {
        match self {
            Self::Executing(exec) => {
                let id = exec.next_observer_id;
                exec.next_observer_id += 1;
                exec.observers.push((id, observer));
                Ok(id)
            }
            Self::Done(exit) => Err((observer, exit.clone())),
        }
    }

    pub(crate) fn remove_observer(&mut self, id: u64) {
        if let Some(exec) = self.executing() {
            exec.observers.retain(|(observer_id, _)| *observer_id != id);
        }
    }

    /// Queues `instr` to run before the fiber's next step.
    pub(crate) fn tell(&mut self, instr: Instr) -> bool {
        let Some(exec) = self.executing() else {
            return false;
        };
        exec.mailbox = Some(match exec.mailbox.take() {
            Some(mail) => mail.then(instr),
            None => instr,
        });
        true
    }

    pub(crate) fn add_child(&mut self, child: Arc<FiberContext>) -> bool {
        match self.executing() {
            Some(exec) => {
                exec.children.insert(child.id(), child);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_child(&mut self, id: FiberId) {
        if let Some(exec) = self.executing() {
            exec.children.remove(&id);
        }
    }

    pub(crate) fn children(&self) -> Vec<Arc<FiberContext>> {
        match self {
            Self::Executing(exec) => exec.children.values().cloned().collect(),
            Self::Done(_) => Vec::new(),
        }
    }

    /// One attempt at completing with `exit`.
    ///
    /// Mail takes precedence, then live children; only with neither does
    /// the fiber become done. The final exit merges in the interruptors and
    /// any suppressed defects. A successful exit stays successful unless a
    /// defect was suppressed; suppressed interruptions alone are dropped.
    pub(crate) fn try_complete(&mut self, exit: &AnyExit, may_drain: bool) -> Completion {
        let Some(exec) = self.executing() else {
            return Completion::AlreadyDone;
        };
        if let Some(mail) = exec.mailbox.take() {
            return if may_drain {
                Completion::Drain(mail)
            } else {
                Completion::Discarded(mail)
            };
        }
        if !exec.children.is_empty() {
            let status = mem::replace(&mut exec.status, FiberStatus::initial());
            exec.status = status.to_finishing().with_interrupting(true);
            return Completion::Children(exec.children.values().cloned().collect());
        }

        let interruptors = exec.interruptors_cause();
        let suppressed = mem::replace(&mut exec.suppressed, Cause::Empty);
        let exit = match exit.clone() {
            AnyExit::Failure(cause) => {
                let cause = if cause.contains_erased(&suppressed) {
                    cause
                } else {
                    cause.then(suppressed)
                };
                let cause = if cause.contains_erased(&interruptors) {
                    cause
                } else {
                    cause.then(interruptors)
                };
                AnyExit::Failure(cause)
            }
            AnyExit::Success(value) => {
                let defects = suppressed
                    .defects()
                    .into_iter()
                    .map(AnyCause::die)
                    .fold(AnyCause::Empty, AnyCause::then);
                if defects.is_empty() {
                    AnyExit::Success(value)
                } else {
                    AnyExit::Failure(defects)
                }
            }
        };
        let observers = mem::take(&mut exec.observers)
            .into_iter()
            .map(|(_, observer)| observer)
            .collect();
        *self = Self::Done(exit.clone());
        Completion::Done { exit, observers }
    }
}

/// What the interpreter must do before dispatching its next instruction.
pub(crate) enum Pending {
    None,
    Interrupt(AnyCause),
    Mail(Instr),
}
