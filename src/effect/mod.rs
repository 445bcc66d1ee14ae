//! Typed effect values.
//!
//! An [`Effect<A, E>`] describes a computation that, when run by a fiber,
//! either produces an `A`, fails with a [`Cause<E>`], or is interrupted.
//! Building an effect performs no work; it only assembles an instruction
//! tree that a [`Runtime`](crate::runtime::Runtime) later interprets.
//!
//! ```rust,ignore
//! let program = Effect::<i32, String>::succeed(20)
//!     .flat_map(|n| Effect::succeed(n + 1))
//!     .map(|n| n * 2);
//! assert_eq!(runtime.run_blocking(program), Exit::Success(42));
//! ```
//!
//! The type parameters are a typed facade over the erased instruction set
//! in [`instr`]: every value crossing the interpreter is an
//! [`AnyValue`](crate::types::AnyValue) and is downcast back at the
//! continuation that consumes it.

mod combinators;
pub(crate) mod instr;

pub use instr::InstrKind;

use crate::fiber::handle::{Fiber, RuntimeFiber};
use crate::fiber::scope::{ForkScope, GlobalScope};
use crate::fiber::Descriptor;
use crate::logger::{self, LogLevel};
use crate::runtime::RuntimeConfig;
use crate::supervisor::Supervisor;
use crate::types::value::{downcast, erase, unit};
use crate::types::{AnyCause, Cause, Defect, Exit, FiberId, Trace, Value};
use instr::{AsyncResume, Instr, Link, Registration};
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A lazy description of a computation producing `A` or failing with `E`.
#[must_use = "effects do nothing unless run"]
pub struct Effect<A, E = Infallible> {
    instr: Instr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({:?})", self.instr)
    }
}

/// Splits an erased cause into its first typed failure, or the cause itself
/// when it carries no typed failure.
fn failure_or_cause<E: Value>(cause: AnyCause) -> Result<E, AnyCause> {
    match cause.failure_option().cloned() {
        Some(error) => Ok(downcast(error)),
        None => Err(cause),
    }
}

fn typed_cause<E: Value>(cause: AnyCause) -> Cause<E> {
    cause.map(downcast)
}

fn erase_cause<E: Value>(cause: Cause<E>) -> AnyCause {
    cause.map(erase)
}

impl<A: Value, E: Value> Effect<A, E> {
    pub(crate) fn from_instr(instr: Instr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Instr {
        self.instr
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// An effect that succeeds with an already computed value.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(Instr::SucceedNow(erase(value)))
    }

    /// An effect that computes its value when run.
    ///
    /// A panic inside `f` becomes a defect of the running fiber.
    pub fn succeed_with(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_instr(Instr::Succeed(Box::new(move || erase(f()))))
    }

    /// Defers construction of an effect until it is run.
    pub fn suspend(f: impl FnOnce() -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::Suspend(Box::new(move || f().instr)))
    }

    /// Fails with a typed error.
    pub fn fail(error: E) -> Self {
        Self::from_instr(Instr::Fail(Box::new(move || Cause::fail(erase(error)))))
    }

    /// Fails with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(Instr::fail_cause(erase_cause(cause)))
    }

    /// Dies with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Self::from_instr(Instr::Fail(Box::new(move || Cause::die(defect))))
    }

    /// Interrupts the running fiber as itself.
    pub fn interrupt() -> Self {
        Self::from_instr(Instr::Descriptor(Box::new(|descriptor| {
            Instr::fail_cause(Cause::interrupt(descriptor.id))
        })))
    }

    /// Interrupts the running fiber as `by`.
    pub fn interrupt_as(by: FiberId) -> Self {
        Self::from_instr(Instr::Fail(Box::new(move || Cause::interrupt(by))))
    }

    /// An effect that never completes. It can only end by interruption.
    pub fn never() -> Self {
        Self::from_instr(Instr::Async {
            register: Box::new(|_| Registration::Suspended(None)),
            blocking_on: FiberId::NONE,
        })
    }

    /// Suspends the fiber until `register`'s callback is invoked.
    ///
    /// `register` runs once, synchronously, when the fiber reaches the
    /// boundary. The callback can be moved to any thread; only its first
    /// completion counts.
    pub fn async_callback(register: impl FnOnce(AsyncCallback<A, E>) + Send + 'static) -> Self {
        Self::async_with(move |callback| {
            register(callback);
            AsyncRegistration::Pending { canceler: None }
        })
    }

    /// Suspends the fiber on an external callback, with the option of
    /// completing synchronously or of supplying a canceler run when the
    /// fiber is interrupted while waiting.
    pub fn async_with(
        register: impl FnOnce(AsyncCallback<A, E>) -> AsyncRegistration<A, E> + Send + 'static,
    ) -> Self {
        Self::from_instr(Instr::Async {
            register: Box::new(move |resume| match register(AsyncCallback::new(resume)) {
                AsyncRegistration::Ready(effect) => Registration::Ready(effect.instr),
                AsyncRegistration::Pending { canceler } => {
                    Registration::Suspended(canceler.map(Effect::into_instr))
                }
            }),
            blocking_on: FiberId::NONE,
        })
    }

    /// Builds an effect from the running fiber's descriptor.
    pub fn descriptor_with(f: impl FnOnce(Descriptor) -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::Descriptor(Box::new(move |descriptor| f(descriptor).instr)))
    }

    /// Builds an effect from the current interruptibility.
    pub fn check_interruptible(f: impl FnOnce(bool) -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::CheckInterrupt(Box::new(move |flag| f(flag).instr)))
    }

    /// Builds an effect from the fork scope new children would attach to.
    pub fn fork_scope_with(f: impl FnOnce(Arc<dyn ForkScope>) -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::GetForkScope(Box::new(move |scope| f(scope).instr)))
    }

    /// Builds an effect from the fiber's runtime configuration.
    pub fn runtime_config_with(f: impl FnOnce(Arc<RuntimeConfig>) -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::GetRuntimeConfig(Box::new(move |config| f(config).instr)))
    }

    /// Lifts a `Result` into an effect.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// Lifts an exit into an effect that succeeds or fails exactly as it
    /// describes.
    pub fn done(exit: Exit<A, E>) -> Self {
        Self::from_instr(Instr::done(exit.erase()))
    }

    /// Runs every effect in order, collecting their values.
    pub fn collect_all(effects: impl IntoIterator<Item = Self>) -> Effect<Vec<A>, E> {
        effects
            .into_iter()
            .fold(Effect::succeed(Vec::new()), |acc, effect| {
                acc.zip_with(effect, |mut values, value| {
                    values.push(value);
                    values
                })
            })
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    /// Transforms the success value.
    #[track_caller]
    pub fn map<B: Value>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::from_instr(
            self.instr
                .flat_map(move |value| Instr::SucceedNow(erase(f(downcast(value))))),
        )
    }

    /// Replaces the success value with `()`.
    #[track_caller]
    pub fn as_unit(self) -> Effect<(), E> {
        Effect::from_instr(self.instr.flat_map(|_| Instr::unit()))
    }

    /// Sequences `f` after this effect.
    #[track_caller]
    pub fn flat_map<B: Value>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_instr(self.instr.flat_map(move |value| f(downcast(value)).instr))
    }

    /// Runs both effects in order and pairs their values.
    #[track_caller]
    pub fn zip<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Runs both effects in order and combines their values with `f`.
    #[track_caller]
    pub fn zip_with<B: Value, C: Value>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E> {
        let location = Location::caller();
        Effect::from_instr(Instr::FlatMap {
            effect: Link::new(self.instr),
            k: Box::new(move |a| {
                that.instr
                    .flat_map(move |b| Instr::SucceedNow(erase(f(downcast(a), downcast(b)))))
            }),
            location,
        })
    }

    /// Runs both effects in order, keeping the first value.
    #[track_caller]
    pub fn zip_left<B: Value>(self, that: Effect<B, E>) -> Self {
        self.zip_with(that, |a, _| a)
    }

    /// Runs both effects in order, keeping the second value.
    #[track_caller]
    pub fn zip_right<B: Value>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_instr(self.instr.then(that.instr))
    }

    /// Waits `duration` before running this effect.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    /// Transforms every typed failure in the cause.
    pub fn map_error<E2: Value>(self, f: impl FnMut(E) -> E2 + Send + 'static) -> Effect<A, E2> {
        self.map_error_cause(move |cause| cause.map(f))
    }

    /// Transforms the whole failure cause.
    pub fn map_error_cause<E2: Value>(
        self,
        f: impl FnOnce(Cause<E>) -> Cause<E2> + Send + 'static,
    ) -> Effect<A, E2> {
        Effect::from_instr(Instr::Fold {
            effect: Link::new(self.instr),
            on_failure: Box::new(move |cause| Instr::fail_cause(erase_cause(f(typed_cause(cause))))),
            on_success: Box::new(Instr::SucceedNow),
        })
    }

    /// Handles the full failure cause or the success value with an effect.
    pub fn fold_cause_effect<B: Value, E2: Value>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2> {
        Effect::from_instr(Instr::Fold {
            effect: Link::new(self.instr),
            on_failure: Box::new(move |cause| on_failure(typed_cause(cause)).instr),
            on_success: Box::new(move |value| on_success(downcast(value)).instr),
        })
    }

    /// Handles the full failure cause or the success value.
    pub fn fold_cause<B: Value, E2: Value>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> B + Send + 'static,
        on_success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E2> {
        self.fold_cause_effect(
            move |cause| Effect::succeed(on_failure(cause)),
            move |value| Effect::succeed(on_success(value)),
        )
    }

    /// Handles a typed failure or the success value with an effect.
    /// Defects and interruptions are not handled and propagate unchanged.
    pub fn fold_effect<B: Value, E2: Value>(
        self,
        on_failure: impl FnOnce(E) -> Effect<B, E2> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2> {
        Effect::from_instr(Instr::Fold {
            effect: Link::new(self.instr),
            on_failure: Box::new(move |cause| match failure_or_cause::<E>(cause) {
                Ok(error) => on_failure(error).instr,
                Err(cause) => Instr::fail_cause(cause),
            }),
            on_success: Box::new(move |value| on_success(downcast(value)).instr),
        })
    }

    /// Handles a typed failure or the success value.
    pub fn fold<B: Value, E2: Value>(
        self,
        on_failure: impl FnOnce(E) -> B + Send + 'static,
        on_success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E2> {
        self.fold_effect(
            move |error| Effect::succeed(on_failure(error)),
            move |value| Effect::succeed(on_success(value)),
        )
    }

    /// Recovers from a typed failure.
    pub fn catch_all<E2: Value>(
        self,
        f: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_effect(f, Effect::succeed)
    }

    /// Recovers from any failure cause, including defects and interruption.
    pub fn catch_all_cause<E2: Value>(
        self,
        f: impl FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Surfaces the outcome as a value. The result never fails.
    pub fn exit<E2: Value>(self) -> Effect<Exit<A, E>, E2> {
        self.fold_cause(Exit::Failure, Exit::Success)
    }

    /// Surfaces typed failures as `Err`. Defects and interruption still
    /// propagate.
    pub fn either<E2: Value>(self) -> Effect<Result<A, E>, E2> {
        self.fold(Err, Ok)
    }

    /// Runs `finalizer` after this effect however it ends. The finalizer
    /// runs uninterruptibly; its own failures are added to the outcome.
    pub fn ensuring(self, finalizer: Effect<()>) -> Self {
        Self::from_instr(Instr::Ensuring {
            effect: Link::new(self.instr),
            finalizer: Box::new(move |_| finalizer.instr),
        })
    }

    /// Runs `cleanup` with the outcome after this effect however it ends.
    pub fn on_exit(self, cleanup: impl FnOnce(Exit<A, E>) -> Effect<()> + Send + 'static) -> Self {
        Self::from_instr(Instr::Ensuring {
            effect: Link::new(self.instr),
            finalizer: Box::new(move |exit| cleanup(Exit::from_erased(exit)).instr),
        })
    }

    /// Runs `cleanup` only when this effect ends by interruption.
    pub fn on_interrupt(self, cleanup: Effect<()>) -> Self {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup
            } else {
                Effect::unit()
            }
        })
    }

    // =========================================================================
    // Interruption
    // =========================================================================

    /// Makes this effect interruptible.
    pub fn interruptible(self) -> Self {
        Self::from_instr(self.instr.interruptible())
    }

    /// Shields this effect from interruption. A pending interruption is
    /// delivered as soon as the region ends.
    pub fn uninterruptible(self) -> Self {
        Self::from_instr(self.instr.uninterruptible())
    }

    /// Runs an uninterruptible region built by `f`; the [`Restorer`] gives
    /// sub-effects back the interruptibility in force outside the region.
    pub fn uninterruptible_mask(f: impl FnOnce(Restorer) -> Self + Send + 'static) -> Self {
        Self::from_instr(Instr::CheckInterrupt(Box::new(move |interruptible| {
            f(Restorer { interruptible }).instr.uninterruptible()
        })))
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    /// Starts this effect on a new fiber attached to the current fork scope.
    #[track_caller]
    pub fn fork<E2: Value>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_into(None, Location::caller())
    }

    /// Starts this effect on a daemon fiber that outlives its parent.
    #[track_caller]
    pub fn fork_daemon<E2: Value>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_into(Some(Arc::new(GlobalScope)), Location::caller())
    }

    /// Starts this effect on a new fiber attached to `scope`.
    #[track_caller]
    pub fn fork_in<E2: Value>(self, scope: Arc<dyn ForkScope>) -> Effect<Fiber<A, E>, E2> {
        self.fork_into(Some(scope), Location::caller())
    }

    fn fork_into<E2: Value>(
        self,
        scope: Option<Arc<dyn ForkScope>>,
        location: &'static Location<'static>,
    ) -> Effect<Fiber<A, E>, E2> {
        Effect::from_instr(
            Instr::Fork {
                effect: Link::new(self.instr),
                scope,
                location,
            }
            .flat_map(|value| {
                let fiber: RuntimeFiber = downcast(value);
                Instr::SucceedNow(erase(Fiber::<A, E>::from_runtime(fiber)))
            }),
        )
    }

    /// Attaches children forked inside this effect to `scope`.
    pub fn with_fork_scope(self, scope: Arc<dyn ForkScope>) -> Self {
        Self::from_instr(Instr::OverrideForkScope {
            scope: Some(scope),
            effect: Link::new(self.instr),
        })
    }

    /// Observes this effect and every fiber it forks with `supervisor`.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        Self::from_instr(Instr::Supervise {
            effect: Link::new(self.instr),
            supervisor,
        })
    }

    /// Runs this effect under `config`, restoring the previous
    /// configuration afterwards.
    pub fn with_runtime_config(self, config: Arc<RuntimeConfig>) -> Self {
        let effect = self.instr;
        Self::from_instr(Instr::GetRuntimeConfig(Box::new(move |previous| {
            Instr::SetRuntimeConfig(config).then(Instr::Ensuring {
                effect: Link::new(effect),
                finalizer: Box::new(move |_| Instr::SetRuntimeConfig(previous)),
            })
        })))
    }

    /// Runs this effect with a log annotation visible to every log record
    /// it emits.
    pub fn annotated(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        let annotations = logger::annotations();
        annotations.get_with(move |mut current| {
            current.insert(key, value);
            annotations.locally(current, self)
        })
    }
}

impl<E: Value> Effect<(), E> {
    /// An effect that succeeds with `()`.
    pub fn unit() -> Self {
        Self::from_instr(Instr::unit())
    }

    /// Hands the fiber back to the scheduler so others can run.
    pub fn yield_now() -> Self {
        Self::from_instr(Instr::Yield)
    }

    /// Suspends the fiber for `duration` on the runtime's timer. An
    /// interrupted sleep cancels its timer entry.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_instr(Instr::GetRuntimeConfig(Box::new(move |config| Instr::Async {
            blocking_on: FiberId::NONE,
            register: Box::new(move |resume: AsyncResume| {
                if duration.is_zero() {
                    return Registration::Ready(Instr::unit());
                }
                let Some(deadline) = Instant::now().checked_add(duration) else {
                    return Registration::Suspended(None);
                };
                let timer = Arc::clone(&config.timer);
                let key = timer.schedule(
                    deadline,
                    Box::new(move || {
                        resume.resume(Instr::unit());
                    }),
                );
                Registration::Suspended(Some(Instr::Succeed(Box::new(move || {
                    timer.cancel(key);
                    unit()
                }))))
            }),
        })))
    }

    /// Emits a log record through the runtime's logger.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::from_instr(Instr::Log {
            level,
            message: message.into(),
            cause: None,
        })
    }

    /// Emits a log record carrying a failure cause.
    pub fn log_cause<E2: Value>(level: LogLevel, message: impl Into<String>, cause: Cause<E2>) -> Self {
        Self::from_instr(Instr::Log {
            level,
            message: message.into(),
            cause: Some(erase_cause(cause)),
        })
    }
}

impl<E: Value> Effect<Descriptor, E> {
    /// The running fiber's descriptor.
    pub fn descriptor() -> Self {
        Self::from_instr(Instr::Descriptor(Box::new(|descriptor| {
            Instr::SucceedNow(erase(descriptor))
        })))
    }
}

impl<E: Value> Effect<FiberId, E> {
    /// The running fiber's id.
    pub fn fiber_id() -> Self {
        Self::from_instr(Instr::Descriptor(Box::new(|descriptor| {
            Instr::SucceedNow(erase(descriptor.id))
        })))
    }
}

impl<E: Value> Effect<Option<Trace>, E> {
    /// The running fiber's execution trace, when tracing is enabled.
    pub fn trace() -> Self {
        Self::from_instr(Instr::Trace)
    }
}

impl<E: Value> Effect<Arc<RuntimeConfig>, E> {
    /// The running fiber's runtime configuration.
    pub fn runtime_config() -> Self {
        Self::from_instr(Instr::GetRuntimeConfig(Box::new(|config| {
            Instr::SucceedNow(erase(config))
        })))
    }
}

/// Restores the interruptibility in force outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restorer {
    interruptible: bool,
}

impl Restorer {
    /// Runs `effect` with the outer interruptibility.
    pub fn restore<A: Value, E: Value>(self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_instr(Instr::InterruptStatus {
            interruptible: self.interruptible,
            effect: Link::new(effect.instr),
        })
    }
}

/// How an [`Effect::async_with`] registration completed.
pub enum AsyncRegistration<A, E> {
    /// The result is already known; the fiber continues without suspending.
    Ready(Effect<A, E>),
    /// The fiber suspends until the callback fires. `canceler` runs if the
    /// fiber is interrupted first.
    Pending {
        /// Cancels the outstanding operation.
        canceler: Option<Effect<()>>,
    },
}

impl<A, E> fmt::Debug for AsyncRegistration<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(effect) => f.debug_tuple("Ready").field(effect).finish(),
            Self::Pending { canceler } => f
                .debug_struct("Pending")
                .field("canceler", &canceler.is_some())
                .finish(),
        }
    }
}

/// Completes a fiber suspended by [`Effect::async_callback`] or
/// [`Effect::async_with`].
///
/// Only the first completion resumes the fiber; later ones return false.
pub struct AsyncCallback<A, E> {
    resume: AsyncResume,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for AsyncCallback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncCallback({})", self.resume.fiber_id())
    }
}

impl<A: Value, E: Value> AsyncCallback<A, E> {
    fn new(resume: AsyncResume) -> Self {
        Self {
            resume,
            _marker: PhantomData,
        }
    }

    /// The fiber waiting on this callback.
    #[must_use]
    pub fn fiber_id(&self) -> FiberId {
        self.resume.fiber_id()
    }

    /// Resumes the fiber with `effect`.
    pub fn resume(&self, effect: Effect<A, E>) -> bool {
        self.resume.resume(effect.instr)
    }

    /// Resumes the fiber with a value.
    pub fn succeed(&self, value: A) -> bool {
        self.resume(Effect::succeed(value))
    }

    /// Resumes the fiber with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.resume(Effect::fail(error))
    }

    /// Resumes the fiber with an exit.
    pub fn complete(&self, exit: Exit<A, E>) -> bool {
        self.resume(Effect::done(exit))
    }
}
