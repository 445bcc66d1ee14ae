//! The instruction set interpreted by a fiber.
//!
//! An effect is a tree of [`Instr`] nodes. Building one performs no work;
//! every node is consumed exactly once by the interpreter loop in
//! [`crate::fiber::context`]. Values and errors are erased to
//! [`AnyValue`] here. Continuations are boxed closures producing the next
//! instruction.

use crate::fiber::context::FiberContext;
use crate::fiber::handle::RuntimeFiber;
use crate::fiber::scope::ForkScope;
use crate::fiber::Descriptor;
use crate::fiber_ref::{FiberRefKey, FiberRefs};
use crate::logger::LogLevel;
use crate::runtime::RuntimeConfig;
use crate::supervisor::Supervisor;
use crate::types::value::{unit, AnyValue};
use crate::types::{AnyCause, AnyExit, FiberId};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

pub(crate) type Thunk = Box<dyn FnOnce() -> AnyValue + Send>;
pub(crate) type Cont = Box<dyn FnOnce(AnyValue) -> Instr + Send>;
pub(crate) type CauseCont = Box<dyn FnOnce(AnyCause) -> Instr + Send>;
pub(crate) type ExitCont = Box<dyn FnOnce(AnyExit) -> Instr + Send>;
pub(crate) type RaceCont = Box<dyn FnOnce(AnyExit, RuntimeFiber) -> Instr + Send>;

/// One node of an effect program.
pub(crate) enum Instr {
    SucceedNow(AnyValue),
    Succeed(Thunk),
    Suspend(Box<dyn FnOnce() -> Instr + Send>),
    FlatMap {
        effect: Link,
        k: Cont,
        location: &'static Location<'static>,
    },
    Fold {
        effect: Link,
        on_failure: CauseCont,
        on_success: Cont,
    },
    Fail(Box<dyn FnOnce() -> AnyCause + Send>),
    Async {
        register: Box<dyn FnOnce(AsyncResume) -> Registration + Send>,
        blocking_on: FiberId,
    },
    Fork {
        effect: Link,
        scope: Option<Arc<dyn ForkScope>>,
        location: &'static Location<'static>,
    },
    InterruptStatus {
        interruptible: bool,
        effect: Link,
    },
    CheckInterrupt(Box<dyn FnOnce(bool) -> Instr + Send>),
    RaceWith(Box<RaceWith>),
    Yield,
    Ensuring {
        effect: Link,
        finalizer: ExitCont,
    },
    Supervise {
        effect: Link,
        supervisor: Arc<dyn Supervisor>,
    },
    FiberRefGetAll(Box<dyn FnOnce(FiberRefs) -> Instr + Send>),
    FiberRefModify {
        key: Arc<FiberRefKey>,
        f: Box<dyn FnOnce(AnyValue) -> (AnyValue, AnyValue) + Send>,
    },
    FiberRefModifyAll(Box<dyn FnOnce(FiberId, FiberRefs) -> (AnyValue, FiberRefs) + Send>),
    FiberRefLocally {
        key: Arc<FiberRefKey>,
        value: AnyValue,
        effect: Link,
    },
    FiberRefDelete(Arc<FiberRefKey>),
    FiberRefWith {
        key: Arc<FiberRefKey>,
        k: Cont,
    },
    GetForkScope(Box<dyn FnOnce(Arc<dyn ForkScope>) -> Instr + Send>),
    OverrideForkScope {
        scope: Option<Arc<dyn ForkScope>>,
        effect: Link,
    },
    SetRuntimeConfig(Arc<RuntimeConfig>),
    GetRuntimeConfig(Box<dyn FnOnce(Arc<RuntimeConfig>) -> Instr + Send>),
    Descriptor(Box<dyn FnOnce(Descriptor) -> Instr + Send>),
    Trace,
    Log {
        level: LogLevel,
        message: String,
        cause: Option<AnyCause>,
    },
}

/// Payload of [`Instr::RaceWith`].
pub(crate) struct RaceWith {
    pub(crate) left: Link,
    pub(crate) right: Link,
    pub(crate) left_wins: RaceCont,
    pub(crate) right_wins: RaceCont,
    pub(crate) scope: Option<Arc<dyn ForkScope>>,
    pub(crate) location: &'static Location<'static>,
}

/// An owned child instruction.
///
/// Programs nest through links, so a long chain built by repeated
/// `flat_map` or `zip` is a linked list of boxes. Dropping a link detaches
/// the nested links onto a work list instead of recursing, so an unrun
/// program of any depth is freed on a bounded native stack.
pub(crate) struct Link(Option<Box<Instr>>);

impl Link {
    pub(crate) fn new(instr: Instr) -> Self {
        Self(Some(Box::new(instr)))
    }

    /// Takes the instruction out for interpretation.
    pub(crate) fn into_instr(mut self) -> Instr {
        self.0.take().map_or_else(Instr::unit, |instr| *instr)
    }

    fn detach(&mut self, pending: &mut Vec<Box<Instr>>) {
        if let Some(instr) = self.0.take() {
            pending.push(instr);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let Some(first) = self.0.take() else {
            return;
        };
        let mut pending = vec![first];
        while let Some(mut instr) = pending.pop() {
            instr.detach_links(&mut pending);
        }
    }
}

/// What an async registration callback reports back synchronously.
pub(crate) enum Registration {
    /// The result is already available; continue with it inline.
    Ready(Instr),
    /// The fiber suspends. The optional instruction cancels the pending
    /// callback; `None` means nothing needs cancelling.
    Suspended(Option<Instr>),
}

/// Resumes a fiber suspended at one particular async boundary.
///
/// The epoch pins the resume to the suspension it was created for: once the
/// fiber has left that suspension (resumed, or interrupted through its
/// canceler) every further call is ignored.
#[derive(Clone)]
pub(crate) struct AsyncResume {
    fiber: Arc<FiberContext>,
    epoch: u64,
}

impl AsyncResume {
    pub(crate) fn new(fiber: Arc<FiberContext>, epoch: u64) -> Self {
        Self { fiber, epoch }
    }

    /// Schedules the fiber to continue with `instr`. Returns false when the
    /// suspension was already resumed.
    pub(crate) fn resume(&self, instr: Instr) -> bool {
        self.fiber.resume_async(self.epoch, instr)
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }
}

/// Instruction tag reported to supervisors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InstrKind {
    /// An already computed value.
    SucceedNow,
    /// A lazily computed value.
    Succeed,
    /// A lazily built effect.
    Suspend,
    /// Sequencing.
    FlatMap,
    /// Failure handling.
    Fold,
    /// Raising a failure.
    Fail,
    /// Suspension on an external callback.
    Async,
    /// Forking a child fiber.
    Fork,
    /// Changing interruptibility.
    InterruptStatus,
    /// Reading interruptibility.
    CheckInterrupt,
    /// Racing two effects.
    RaceWith,
    /// Yielding to the scheduler.
    Yield,
    /// Registering a finalizer.
    Ensuring,
    /// Installing a supervisor.
    Supervise,
    /// Fiber-local variable access.
    FiberRef,
    /// Fork scope access.
    ForkScope,
    /// Runtime configuration access.
    RuntimeConfig,
    /// Reading the fiber descriptor.
    Descriptor,
    /// Capturing a trace.
    Trace,
    /// Emitting a log record.
    Log,
}

impl Instr {
    pub(crate) fn unit() -> Self {
        Self::SucceedNow(unit())
    }

    pub(crate) fn fail_cause(cause: AnyCause) -> Self {
        Self::Fail(Box::new(move || cause))
    }

    pub(crate) fn done(exit: AnyExit) -> Self {
        match exit {
            AnyExit::Success(v) => Self::SucceedNow(v),
            AnyExit::Failure(c) => Self::fail_cause(c),
        }
    }

    #[track_caller]
    pub(crate) fn flat_map(self, k: impl FnOnce(AnyValue) -> Self + Send + 'static) -> Self {
        Self::FlatMap {
            effect: Link::new(self),
            k: Box::new(k),
            location: Location::caller(),
        }
    }

    /// Runs `self`, discards its value, then runs `next`.
    #[track_caller]
    pub(crate) fn then(self, next: Self) -> Self {
        self.flat_map(move |_| next)
    }

    pub(crate) fn uninterruptible(self) -> Self {
        Self::InterruptStatus {
            interruptible: false,
            effect: Link::new(self),
        }
    }

    pub(crate) fn interruptible(self) -> Self {
        Self::InterruptStatus {
            interruptible: true,
            effect: Link::new(self),
        }
    }

    /// Moves every directly nested instruction onto `pending`.
    fn detach_links(&mut self, pending: &mut Vec<Box<Instr>>) {
        match self {
            Self::FlatMap { effect, .. }
            | Self::Fold { effect, .. }
            | Self::Fork { effect, .. }
            | Self::InterruptStatus { effect, .. }
            | Self::Ensuring { effect, .. }
            | Self::Supervise { effect, .. }
            | Self::FiberRefLocally { effect, .. }
            | Self::OverrideForkScope { effect, .. } => effect.detach(pending),
            Self::RaceWith(race) => {
                race.left.detach(pending);
                race.right.detach(pending);
            }
            _ => {}
        }
    }

    pub(crate) fn kind(&self) -> InstrKind {
        match self {
            Self::SucceedNow(_) => InstrKind::SucceedNow,
            Self::Succeed(_) => InstrKind::Succeed,
            Self::Suspend(_) => InstrKind::Suspend,
            Self::FlatMap { .. } => InstrKind::FlatMap,
            Self::Fold { .. } => InstrKind::Fold,
            Self::Fail(_) => InstrKind::Fail,
            Self::Async { .. } => InstrKind::Async,
            Self::Fork { .. } => InstrKind::Fork,
            Self::InterruptStatus { .. } => InstrKind::InterruptStatus,
            Self::CheckInterrupt(_) => InstrKind::CheckInterrupt,
            Self::RaceWith(_) => InstrKind::RaceWith,
            Self::Yield => InstrKind::Yield,
            Self::Ensuring { .. } => InstrKind::Ensuring,
            Self::Supervise { .. } => InstrKind::Supervise,
            Self::FiberRefGetAll(_)
            | Self::FiberRefModify { .. }
            | Self::FiberRefModifyAll(_)
            | Self::FiberRefLocally { .. }
            | Self::FiberRefDelete(_)
            | Self::FiberRefWith { .. } => InstrKind::FiberRef,
            Self::GetForkScope(_) | Self::OverrideForkScope { .. } => InstrKind::ForkScope,
            Self::SetRuntimeConfig(_) | Self::GetRuntimeConfig(_) => InstrKind::RuntimeConfig,
            Self::Descriptor(_) => InstrKind::Descriptor,
            Self::Trace => InstrKind::Trace,
            Self::Log { .. } => InstrKind::Log,
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instr::{:?}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cause, Exit};

    #[test]
    fn done_maps_exit_to_instruction() {
        assert_eq!(Instr::done(Exit::Success(unit())).kind(), InstrKind::SucceedNow);
        let failed: AnyExit = Exit::Failure(Cause::die("x"));
        assert_eq!(Instr::done(failed).kind(), InstrKind::Fail);
    }

    #[test]
    fn combinators_build_nodes() {
        assert_eq!(Instr::unit().then(Instr::Yield).kind(), InstrKind::FlatMap);
        assert_eq!(Instr::unit().uninterruptible().kind(), InstrKind::InterruptStatus);
        assert_eq!(format!("{:?}", Instr::Trace), "Instr::Trace");
    }

    #[test]
    fn link_hands_back_its_instruction() {
        let link = Link::new(Instr::Yield);
        assert_eq!(link.into_instr().kind(), InstrKind::Yield);
    }

    fn deep_chain(depth: usize) -> Instr {
        (0..depth).fold(Instr::unit(), |acc, i| {
            let nested = if i % 2 == 0 {
                acc.uninterruptible()
            } else {
                acc.then(Instr::unit())
            };
            nested.flat_map(Instr::SucceedNow)
        })
    }

    #[test]
    fn dropping_a_deep_unrun_program_keeps_the_stack_bounded() {
        crate::test_utils::init_test_logging();
        crate::test_phase!("dropping_a_deep_unrun_program_keeps_the_stack_bounded");
        let dropped = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                drop(deep_chain(200_000));
                let left = Instr::RaceWith(Box::new(RaceWith {
                    left: Link::new(deep_chain(50_000)),
                    right: Link::new(deep_chain(50_000)),
                    left_wins: Box::new(|_, _| Instr::unit()),
                    right_wins: Box::new(|_, _| Instr::unit()),
                    scope: None,
                    location: Location::caller(),
                }));
                drop(left);
            })
            .expect("spawn dropper")
            .join();
        assert!(dropped.is_ok(), "drop overflowed the stack");
        crate::test_complete!("dropping_a_deep_unrun_program_keeps_the_stack_bounded");
    }
}
