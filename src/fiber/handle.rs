//! Handles to running fibers.
//!
//! [`Fiber<A, E>`] is the typed handle returned by [`Effect::fork`]: every
//! operation on it is itself an effect, run by the fiber that holds the
//! handle. [`RuntimeFiber`] is the erased view handed to supervisors and
//! fork scopes.

use crate::effect::instr::{Instr, Link};
use crate::effect::Effect;
use crate::fiber::context::FiberContext;
use crate::fiber::scope::GlobalScope;
use crate::fiber::status::FiberStatus;
use crate::fiber_ref::inherit_refs;
use crate::types::value::{downcast, erase};
use crate::types::{AnyExit, Exit, FiberId, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;

/// Erased handle to a fiber.
#[derive(Clone)]
pub struct RuntimeFiber {
    context: Arc<FiberContext>,
}

impl RuntimeFiber {
    pub(crate) fn new(context: Arc<FiberContext>) -> Self {
        Self { context }
    }

    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.context
    }

    /// The fiber's identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// Snapshot of the fiber's lifecycle status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// True once the fiber has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.context.poll().is_some()
    }

    /// The erased exit, once done.
    #[must_use]
    pub fn poll(&self) -> Option<AnyExit> {
        self.context.poll()
    }

    /// Live children attached to this fiber's local scope.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        self.context
            .children()
            .into_iter()
            .map(Self::new)
            .collect()
    }
}

impl fmt::Debug for RuntimeFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuntimeFiber({})", self.id())
    }
}

impl PartialEq for RuntimeFiber {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for RuntimeFiber {}

impl Hash for RuntimeFiber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Typed handle to a forked fiber producing `A` or failing with `E`.
pub struct Fiber<A, E> {
    inner: RuntimeFiber,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.inner.id())
    }
}

impl<A: Value, E: Value> Fiber<A, E> {
    pub(crate) fn from_runtime(inner: RuntimeFiber) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The fiber's identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.inner.id()
    }

    /// Snapshot of the fiber's lifecycle status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    /// The erased handle.
    #[must_use]
    pub fn runtime_fiber(&self) -> &RuntimeFiber {
        &self.inner
    }

    /// Waits for the fiber and yields its exit without re-raising it.
    pub fn await_exit<E2: Value>(&self) -> Effect<Exit<A, E>, E2> {
        Effect::from_instr(typed_exit::<A, E>(self.inner.context.await_done()))
    }

    /// Waits for the fiber, inherits its fiber refs, then succeeds or fails
    /// exactly as it did.
    pub fn join(&self) -> Effect<A, E> {
        let context = Arc::clone(&self.inner.context);
        Effect::from_instr(context.await_done().flat_map(move |value| {
            let exit: AnyExit = downcast(value);
            inherit_refs(context.refs_snapshot()).then(Instr::done(exit))
        }))
    }

    /// Interrupts the fiber as the calling fiber and waits for it to finish.
    pub fn interrupt<E2: Value>(&self) -> Effect<Exit<A, E>, E2> {
        let context = Arc::clone(&self.inner.context);
        Effect::from_instr(typed_exit::<A, E>(Instr::Descriptor(Box::new(
            move |descriptor| context.interrupt_as(descriptor.id),
        ))))
    }

    /// Interrupts the fiber as `by` and waits for it to finish.
    pub fn interrupt_as<E2: Value>(&self, by: FiberId) -> Effect<Exit<A, E>, E2> {
        Effect::from_instr(typed_exit::<A, E>(self.inner.context.interrupt_as(by)))
    }

    /// Interrupts the fiber from a background daemon without waiting.
    #[track_caller]
    pub fn interrupt_fork<E2: Value>(&self) -> Effect<(), E2> {
        let context = Arc::clone(&self.inner.context);
        let location = Location::caller();
        Effect::from_instr(Instr::Descriptor(Box::new(move |descriptor| {
            Instr::Fork {
                effect: Link::new(context.interrupt_as(descriptor.id)),
                scope: Some(Arc::new(GlobalScope)),
                location,
            }
            .then(Instr::unit())
        })))
    }

    /// Merges the fiber's current fiber-ref values into the calling fiber.
    pub fn inherit_refs<E2: Value>(&self) -> Effect<(), E2> {
        let context = Arc::clone(&self.inner.context);
        Effect::from_instr(Instr::Suspend(Box::new(move || {
            inherit_refs(context.refs_snapshot())
        })))
    }

    /// The exit if the fiber is done, without waiting.
    pub fn poll<E2: Value>(&self) -> Effect<Option<Exit<A, E>>, E2> {
        let context = Arc::clone(&self.inner.context);
        Effect::from_instr(Instr::Succeed(Box::new(move || {
            erase(context.poll().map(Exit::<A, E>::from_erased))
        })))
    }

    /// Injects `effect` into the fiber, to run before its next instruction.
    /// Returns false when the fiber is already done.
    pub fn tell(&self, effect: Effect<(), E>) -> bool {
        self.inner.context.tell(effect.into_instr())
    }
}

/// Maps an instruction yielding an erased exit to one yielding the typed
/// exit.
fn typed_exit<A: Value, E: Value>(instr: Instr) -> Instr {
    instr.flat_map(|value| {
        let exit: AnyExit = downcast(value);
        Instr::SucceedNow(erase(Exit::<A, E>::from_erased(exit)))
    })
}
