//! The fiber interpreter.
//!
//! A [`FiberContext`] owns one fiber's shared state record and drives its
//! trampoline loop. The loop consumes one [`Instr`] per step and produces the
//! next one until the fiber completes, suspends on an async boundary, or
//! exhausts its operation budget and hands itself back to the scheduler.
//!
//! # Single runner
//!
//! The per-fiber run state (continuation stack, interrupt-status stack and
//! friends) is moved by value between whoever is running the fiber. While a
//! fiber is suspended the run state is parked on the context, and exactly
//! one party (the one that wins the suspension's epoch) takes it back. No
//! two threads ever interpret the same fiber at once, and no lock is held
//! while user code runs.
//!
//! # Escapes
//!
//! Every step runs under `catch_unwind`. Unwinds carrying a
//! [`FiberSignal`](crate::fiber::signal) become an interruption or an early
//! exit, unwinds carrying a [`FatalError`] abort the loop through the fatal
//! hook, and any other panic becomes a defect unless the runtime's
//! `is_fatal` predicate says otherwise.

use crate::effect::instr::{AsyncResume, Instr, RaceCont, RaceWith, Registration};
use crate::error::FatalError;
use crate::fiber::current;
use crate::fiber::handle::RuntimeFiber;
use crate::fiber::scope::{ForkScope, GlobalScope, LocalScope};
use crate::fiber::signal::FiberSignal;
use crate::fiber::stack::{Frame, Handler, RunState};
use crate::fiber::state::{
    CancelerOutcome, Completion, FiberState, InterruptAction, Observer, Pending,
};
use crate::fiber::status::FiberStatus;
use crate::fiber::Descriptor;
use crate::fiber_ref::{inherit_refs, FiberRefKey, FiberRefs};
use crate::logger::{self, LogLevel, LogRecord};
use crate::runtime::{fatal, RuntimeConfig};
use crate::supervisor::Supervisor;
use crate::tracing_compat::{error, trace, warn};
use crate::types::value::{erase, unit, AnyValue};
use crate::types::{AnyCause, AnyExit, Cause, Defect, Exit, FiberId};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

thread_local! {
    /// How many eagerly started fiber loops are nested on this thread.
    static EAGER_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Restores the eager-start depth when an inline child loop returns.
struct EagerGuard {
    previous: usize,
}

impl EagerGuard {
    fn enter(previous: usize) -> Self {
        EAGER_DEPTH.with(|depth| depth.set(previous + 1));
        Self { previous }
    }
}

impl Drop for EagerGuard {
    fn drop(&mut self) {
        EAGER_DEPTH.with(|depth| depth.set(self.previous));
    }
}

/// What a single step asks of the loop.
enum Step {
    /// Continue with this instruction.
    Next(Instr),
    /// Hand the fiber back to the scheduler, continuing with this
    /// instruction.
    Reschedule(Instr),
    /// The fiber suspended; whoever resumes it owns the run state.
    Suspended,
    /// The fiber completed.
    Done,
}

/// One fiber: its shared state record plus everything needed to run it.
pub(crate) struct FiberContext {
    id: FiberId,
    scope_id: FiberId,
    start: Instant,
    state: Mutex<FiberState>,
    run: Mutex<Option<RunState>>,
    refs: Mutex<FiberRefs>,
    config: RwLock<Arc<RuntimeConfig>>,
    parent: Mutex<Option<Weak<FiberContext>>>,
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl FiberContext {
    fn new(id: FiberId, refs: FiberRefs, config: Arc<RuntimeConfig>, scope_id: FiberId) -> Self {
        config.metrics.record_start();
        trace!(fiber_id = %id, scope_id = %scope_id, "fiber created");
        Self {
            id,
            scope_id,
            start: Instant::now(),
            state: Mutex::new(FiberState::new()),
            run: Mutex::new(None),
            refs: Mutex::new(refs),
            config: RwLock::new(config),
            parent: Mutex::new(None),
        }
    }

    /// Creates a root fiber in the global scope. It does not run until
    /// [`FiberContext::start_root`] is called, so observers can be attached
    /// first.
    pub(crate) fn root(config: Arc<RuntimeConfig>, refs: FiberRefs) -> Arc<Self> {
        Arc::new(Self::new(FiberId::next(), refs, config, FiberId::NONE))
    }

    /// Registers a root fiber with supervision and submits it.
    pub(crate) fn start_root(self: &Arc<Self>, instr: Instr) {
        let config = self.config();
        let fiber = RuntimeFiber::new(Arc::clone(self));
        let refs = self.refs_snapshot();
        self.supervise(&config, &[], "on_start", |s| s.on_start(&refs, None, &fiber));
        let first = if GlobalScope.add(&config, &fiber) {
            instr
        } else {
            Instr::fail_cause(Cause::interrupt(FiberId::NONE))
        };
        let rs = RunState::new(true, Vec::new(), config.trace_depth);
        let ctx = Arc::clone(self);
        config
            .scheduler
            .schedule_task(Box::new(move || ctx.run_until(rs, first)));
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn config(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.config.read())
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.state.lock().status()
    }

    /// The exit, once done.
    pub(crate) fn poll(&self) -> Option<AnyExit> {
        self.state.lock().exit()
    }

    pub(crate) fn refs_snapshot(&self) -> FiberRefs {
        self.refs.lock().clone()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Self>) {
        *self.parent.lock() = Some(parent);
    }

    pub(crate) fn add_child(&self, child: &Arc<Self>) -> bool {
        self.state.lock().add_child(Arc::clone(child))
    }

    pub(crate) fn children(&self) -> Vec<Arc<Self>> {
        self.state.lock().children()
    }

    /// Registers a completion callback. A done fiber runs the callback right
    /// away, on the calling thread, and returns `None`.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let registered = self.state.lock().add_observer(observer);
        match registered {
            Ok(id) => Some(id),
            Err((observer, exit)) => {
                observer(exit);
                None
            }
        }
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        self.state.lock().remove_observer(id);
    }

    /// Injects `instr` to run before the fiber's next instruction.
    pub(crate) fn tell(&self, instr: Instr) -> bool {
        self.state.lock().tell(instr)
    }

    // =========================================================================
    // Cross-fiber protocol
    // =========================================================================

    /// Resumes the suspension identified by `epoch`. The fiber continues on
    /// the scheduler, never inline. Returns false for a stale resume.
    pub(crate) fn resume_async(self: &Arc<Self>, epoch: u64, instr: Instr) -> bool {
        if self.state.lock().exit_async(epoch) {
            self.schedule_resume(instr);
            true
        } else {
            false
        }
    }

    /// Records an interruption by `by`, cancelling the current suspension
    /// when it is interruptible and has a registered canceler.
    pub(crate) fn interrupt_signal(self: &Arc<Self>, by: FiberId) {
        let action = self.state.lock().interrupt(by);
        match action {
            InterruptAction::Resume(instr) => {
                trace!(fiber_id = %self.id, by = %by, "interrupting suspended fiber");
                self.schedule_resume(instr);
            }
            InterruptAction::Recorded => {
                trace!(fiber_id = %self.id, by = %by, "interruption recorded");
            }
            InterruptAction::Ignored => {}
        }
    }

    /// Effect that waits for completion and yields the erased exit.
    pub(crate) fn await_done(self: &Arc<Self>) -> Instr {
        let fiber = Arc::clone(self);
        Instr::Async {
            blocking_on: self.id,
            register: Box::new(move |resume: AsyncResume| {
                if let Some(exit) = fiber.poll() {
                    return Registration::Ready(Instr::SucceedNow(erase(exit)));
                }
                let observer: Observer = Box::new(move |exit| {
                    resume.resume(Instr::SucceedNow(erase(exit)));
                });
                match fiber.add_observer(observer) {
                    Some(id) => {
                        let canceler = Instr::Succeed(Box::new(move || {
                            fiber.remove_observer(id);
                            unit()
                        }));
                        Registration::Suspended(Some(canceler))
                    }
                    None => Registration::Suspended(None),
                }
            }),
        }
    }

    /// Effect that interrupts this fiber as `by` and waits for it.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) -> Instr {
        let fiber = Arc::clone(self);
        Instr::Suspend(Box::new(move || {
            fiber.interrupt_signal(by);
            fiber.await_done()
        }))
    }

    fn schedule_resume(self: &Arc<Self>, instr: Instr) {
        let ctx = Arc::clone(self);
        self.config()
            .scheduler
            .schedule_task(Box::new(move || ctx.resume_parked(instr)));
    }

    fn resume_parked(self: &Arc<Self>, instr: Instr) {
        let parked = self.run.lock().take();
        match parked {
            Some(rs) => self.run_until(rs, instr),
            None => self.report_fatal(
                &self.config(),
                FatalError::MissingRunState { fiber_id: self.id },
            ),
        }
    }

    fn unpark(&self) -> RunState {
        match self.run.lock().take() {
            Some(rs) => rs,
            None => panic::panic_any(FatalError::MissingRunState { fiber_id: self.id }),
        }
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Starts a freshly forked child, inline while the eager-start depth
    /// allows it, otherwise on the scheduler.
    fn start(self: &Arc<Self>, config: &RuntimeConfig, rs: RunState, instr: Instr) {
        let depth = EAGER_DEPTH.with(Cell::get);
        if depth < config.eager_fork_depth {
            let _guard = EagerGuard::enter(depth);
            self.run_until(rs, instr);
        } else {
            let ctx = Arc::clone(self);
            config
                .scheduler
                .schedule_task(Box::new(move || ctx.run_until(rs, instr)));
        }
    }

    /// Runs the fiber until it completes, suspends, or exhausts its budget.
    pub(crate) fn run_until(self: &Arc<Self>, mut rs: RunState, mut instr: Instr) {
        let mut config = self.config();
        let _current = current::enter(self.id, config.enable_current_fiber);
        self.supervise(&config, &rs.supervisors, "on_resume", |s| s.on_resume(self.id));

        let mut ops = 0_usize;
        loop {
            if ops >= config.max_ops {
                trace!(fiber_id = %self.id, ops, "operation budget exhausted, yielding");
                self.reschedule(&config, rs, instr);
                return;
            }
            ops += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.step(&mut rs, &mut config, instr)
            }));
            instr = match outcome {
                Ok(Step::Next(next)) => next,
                Ok(Step::Reschedule(next)) => {
                    self.reschedule(&config, rs, next);
                    return;
                }
                Ok(Step::Suspended | Step::Done) => return,
                Err(payload) => match self.escape(&config, payload) {
                    Ok(next) => next,
                    Err(fatal) => {
                        self.report_fatal(&config, fatal);
                        return;
                    }
                },
            };
        }
    }

    fn reschedule(self: &Arc<Self>, config: &RuntimeConfig, rs: RunState, instr: Instr) {
        let ctx = Arc::clone(self);
        config
            .scheduler
            .schedule_fair(Box::new(move || ctx.run_until(rs, instr)));
    }

    /// Classifies a caught unwind.
    ///
    /// Escapes that raise a cause mark the fiber as interrupting until the
    /// cause reaches a handler. An early exit with a value is delivered like
    /// any other value and leaves the fiber interruptible.
    fn escape(
        &self,
        config: &RuntimeConfig,
        payload: Box<dyn Any + Send>,
    ) -> Result<Instr, FatalError> {
        let payload = match payload.downcast::<FiberSignal>() {
            Ok(signal) => {
                return Ok(match *signal {
                    FiberSignal::Interrupt => self.raise(Cause::interrupt(self.id)),
                    FiberSignal::EarlyExit(Exit::Failure(cause)) => self.raise(cause),
                    FiberSignal::EarlyExit(exit) => Instr::done(exit),
                })
            }
            Err(other) => other,
        };
        let payload = match payload.downcast::<FatalError>() {
            Ok(fatal) => return Err(*fatal),
            Err(other) => other,
        };
        let defect = Defect::from_panic(&*payload);
        if (config.is_fatal)(&defect) {
            Err(FatalError::FatalDefect {
                fiber_id: self.id,
                defect,
            })
        } else {
            Ok(self.raise(Cause::die(defect)))
        }
    }

    fn raise(&self, cause: AnyCause) -> Instr {
        self.state.lock().set_interrupting(true);
        Instr::fail_cause(cause)
    }

    fn step(
        self: &Arc<Self>,
        rs: &mut RunState,
        config: &mut Arc<RuntimeConfig>,
        instr: Instr,
    ) -> Step {
        let pending = self.state.lock().poll_pending(rs.is_interruptible());
        let instr = match pending {
            Pending::None => instr,
            Pending::Interrupt(cause) => Instr::fail_cause(cause),
            Pending::Mail(mail) => mail.then(instr),
        };

        if config.supervisor.is_some() || !rs.supervisors.is_empty() {
            let kind = instr.kind();
            self.supervise(config, &rs.supervisors, "on_effect", |s| s.on_effect(self.id, kind));
        }

        match instr {
            Instr::SucceedNow(value) => self.next_instr(rs, config, value),
            Instr::Succeed(thunk) => {
                let value = thunk();
                self.next_instr(rs, config, value)
            }
            Instr::Suspend(thunk) => Step::Next(thunk()),
            Instr::FlatMap {
                effect,
                k,
                location,
            } => {
                rs.record(location);
                rs.stack.push(Frame::Apply(k));
                Step::Next(effect.into_instr())
            }
            Instr::Fold {
                effect,
                on_failure,
                on_success,
            } => {
                rs.stack.push(Frame::Fold {
                    on_failure,
                    on_success,
                });
                Step::Next(effect.into_instr())
            }
            Instr::Fail(make) => {
                let cause = make();
                self.fail(rs, config, cause)
            }
            Instr::Async {
                register,
                blocking_on,
            } => self.suspend_async(rs, config, register, blocking_on),
            Instr::Fork {
                effect,
                scope,
                location,
            } => {
                let fiber = self.fork(rs, config, effect.into_instr(), scope, location);
                self.next_instr(rs, config, erase(fiber))
            }
            Instr::InterruptStatus {
                interruptible,
                effect,
            } => {
                rs.push_interrupt_status(interruptible);
                Step::Next(effect.into_instr())
            }
            Instr::CheckInterrupt(k) => Step::Next(k(rs.is_interruptible())),
            Instr::RaceWith(race) => Step::Next(self.race_with(rs, config, *race)),
            Instr::Yield => Step::Reschedule(Instr::unit()),
            Instr::Ensuring { effect, finalizer } => {
                rs.stack.push(Frame::Finalizer(finalizer));
                Step::Next(effect.into_instr())
            }
            Instr::Supervise { effect, supervisor } => {
                rs.supervisors.push(supervisor);
                rs.stack.push(Frame::SupervisorExit);
                Step::Next(effect.into_instr())
            }
            Instr::FiberRefGetAll(k) => Step::Next(k(self.refs_snapshot())),
            Instr::FiberRefModify { key, f } => {
                let current = self.refs.lock().get(&key);
                let (result, updated) = f(current);
                self.refs.lock().set(&key, updated);
                self.next_instr(rs, config, result)
            }
            Instr::FiberRefModifyAll(f) => {
                let (result, refs) = f(self.id, self.refs_snapshot());
                *self.refs.lock() = refs;
                self.next_instr(rs, config, result)
            }
            Instr::FiberRefLocally { key, value, effect } => {
                let previous = {
                    let mut refs = self.refs.lock();
                    let previous = refs.get_opt(&key);
                    refs.set(&key, value);
                    previous
                };
                rs.stack
                    .push(Frame::Finalizer(Box::new(move |_| restore_ref(key, previous))));
                Step::Next(effect.into_instr())
            }
            Instr::FiberRefDelete(key) => {
                self.refs.lock().remove(&key);
                self.next_instr(rs, config, unit())
            }
            Instr::FiberRefWith { key, k } => {
                let value = self.refs.lock().get(&key);
                Step::Next(k(value))
            }
            Instr::GetForkScope(k) => Step::Next(k(self.current_scope(rs))),
            Instr::OverrideForkScope { scope, effect } => {
                rs.fork_scopes.push(scope);
                rs.stack.push(Frame::ForkScopeExit);
                Step::Next(effect.into_instr())
            }
            Instr::SetRuntimeConfig(new_config) => {
                *self.config.write() = Arc::clone(&new_config);
                *config = new_config;
                self.next_instr(rs, config, unit())
            }
            Instr::GetRuntimeConfig(k) => Step::Next(k(Arc::clone(config))),
            Instr::Descriptor(k) => Step::Next(k(self.descriptor(rs))),
            Instr::Trace => {
                let trace = rs.capture_trace(self.id);
                self.next_instr(rs, config, erase(trace))
            }
            Instr::Log {
                level,
                message,
                cause,
            } => {
                self.log(rs, config, level, message, cause);
                self.next_instr(rs, config, unit())
            }
        }
    }

    /// Delivers a value to the next continuation frame.
    fn next_instr(
        self: &Arc<Self>,
        rs: &mut RunState,
        config: &RuntimeConfig,
        value: AnyValue,
    ) -> Step {
        loop {
            match rs.stack.pop() {
                None => return self.try_done(rs, config, Exit::Success(value)),
                Some(Frame::Apply(k)) => return Step::Next(k(value)),
                Some(Frame::Fold { on_success, .. }) => return Step::Next(on_success(value)),
                Some(Frame::InterruptExit) => {
                    rs.pop_interrupt_status();
                    // Leaving an uninterruptible region: recheck before going on.
                    return Step::Next(Instr::SucceedNow(value));
                }
                Some(Frame::SupervisorExit) => {
                    rs.supervisors.pop();
                }
                Some(Frame::ForkScopeExit) => {
                    rs.fork_scopes.pop();
                }
                Some(Frame::Finalizer(fin)) => {
                    let delivered = Arc::clone(&value);
                    let restore = Frame::Fold {
                        on_failure: Box::new(Instr::fail_cause),
                        on_success: Box::new(move |_| Instr::SucceedNow(value)),
                    };
                    push_finalizer_region(rs, restore);
                    return Step::Next(fin(Exit::Success(delivered)));
                }
            }
        }
    }

    /// Raises `cause`: unwinds to the nearest handler or completes the fiber.
    fn fail(self: &Arc<Self>, rs: &mut RunState, config: &RuntimeConfig, cause: AnyCause) -> Step {
        let cause = if cause.is_annotated() || cause.is_empty() {
            cause
        } else {
            match rs.capture_trace(self.id) {
                Some(trace) => cause.traced(trace),
                None => cause,
            }
        };

        let unwind = rs.unwind(|rs| {
            rs.is_interruptible() && self.state.lock().is_interrupt_pending()
        });
        let cause = if unwind.discarded_folds {
            cause.strip_erased()
        } else {
            cause
        };
        let suppressed = self.state.lock().clear_suppressed();
        let full = if cause.contains_erased(&suppressed) {
            cause
        } else {
            cause.then(suppressed)
        };

        match unwind.handler {
            None => {
                self.state.lock().set_interrupting(true);
                self.try_done(rs, config, Exit::Failure(full))
            }
            Some(Handler::Fold(on_failure)) => {
                self.state.lock().set_interrupting(false);
                Step::Next(on_failure(full))
            }
            Some(Handler::Finalizer(fin)) => {
                self.state.lock().set_interrupting(false);
                let on_failure_cause = full.clone();
                let on_success_cause = full.clone();
                let restore = Frame::Fold {
                    on_failure: Box::new(move |finalizer_cause| {
                        Instr::fail_cause(on_failure_cause.then(finalizer_cause))
                    }),
                    on_success: Box::new(move |_| Instr::fail_cause(on_success_cause)),
                };
                push_finalizer_region(rs, restore);
                Step::Next(fin(Exit::Failure(full)))
            }
        }
    }

    fn suspend_async(
        self: &Arc<Self>,
        rs: &mut RunState,
        config: &RuntimeConfig,
        register: Box<dyn FnOnce(AsyncResume) -> Registration + Send>,
        blocking_on: FiberId,
    ) -> Step {
        let epoch = rs.async_epoch;
        rs.async_epoch += 1;
        let interruptible = rs.is_interruptible();
        let trace = rs.capture_trace(self.id);
        self.supervise(config, &rs.supervisors, "on_suspend", |s| s.on_suspend(self.id));

        *self.run.lock() = Some(mem::take(rs));
        self.state
            .lock()
            .enter_async(epoch, interruptible, blocking_on, trace);

        let resume = AsyncResume::new(Arc::clone(self), epoch);
        let registration = panic::catch_unwind(AssertUnwindSafe(|| register(resume)));
        match registration {
            Ok(Registration::Ready(instr)) => {
                if self.state.lock().exit_async(epoch) {
                    *rs = self.unpark();
                    Step::Next(instr)
                } else {
                    Step::Suspended
                }
            }
            Ok(Registration::Suspended(canceler)) => {
                let canceler = canceler.unwrap_or_else(Instr::unit);
                let outcome = self.state.lock().set_async_canceler(self.id, epoch, canceler);
                match outcome {
                    Ok(CancelerOutcome::Registered | CancelerOutcome::Stale) => Step::Suspended,
                    Ok(CancelerOutcome::InterruptNow(instr)) => {
                        *rs = self.unpark();
                        Step::Next(instr)
                    }
                    Err(fatal) => panic::panic_any(fatal),
                }
            }
            Err(payload) => {
                if self.state.lock().exit_async(epoch) {
                    *rs = self.unpark();
                    panic::resume_unwind(payload)
                }
                Step::Suspended
            }
        }
    }

    /// Completes the fiber, unless mail or live children hold it open.
    fn try_done(self: &Arc<Self>, rs: &mut RunState, config: &RuntimeConfig, exit: AnyExit) -> Step {
        loop {
            let may_drain = rs.mailbox_drains < config.mailbox_drain_limit;
            let completion = self.state.lock().try_complete(&exit, may_drain);
            match completion {
                Completion::Drain(mail) => {
                    rs.mailbox_drains += 1;
                    return Step::Next(mail.then(Instr::done(exit)));
                }
                Completion::Discarded(_) => {
                    warn!(
                        fiber_id = %self.id,
                        limit = config.mailbox_drain_limit,
                        "mailbox refilled past the drain limit during completion, discarding"
                    );
                }
                Completion::Children(children) => {
                    trace!(fiber_id = %self.id, children = children.len(), "interrupting children before completion");
                    let interrupts = children
                        .iter()
                        .fold(Instr::unit(), |acc, child| acc.then(child.interrupt_as(self.id)));
                    return Step::Next(interrupts.then(Instr::done(exit)));
                }
                Completion::AlreadyDone => return Step::Done,
                Completion::Done { exit, observers } => {
                    self.finish(rs, config, &exit, observers);
                    return Step::Done;
                }
            }
        }
    }

    fn finish(
        self: &Arc<Self>,
        rs: &RunState,
        config: &RuntimeConfig,
        exit: &AnyExit,
        observers: Vec<Observer>,
    ) {
        let parent = self.parent.lock().take().and_then(|parent| parent.upgrade());
        if let Some(parent) = parent {
            parent.state.lock().remove_child(self.id);
        }

        let fiber = RuntimeFiber::new(Arc::clone(self));
        self.supervise(config, &rs.supervisors, "on_end", |s| s.on_end(exit, &fiber));
        config
            .metrics
            .record_end(exit.is_success(), self.start.elapsed());
        trace!(fiber_id = %self.id, success = exit.is_success(), "fiber done");

        if observers.is_empty() {
            if let Exit::Failure(cause) = exit {
                if !cause.is_interrupted_only() {
                    self.log(
                        rs,
                        config,
                        config.unhandled_log_level,
                        format!("fiber {} failed with an unhandled cause", self.id),
                        Some(cause.clone()),
                    );
                }
            }
        }

        for observer in observers {
            let exit = exit.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| observer(exit))).is_err() {
                error!(fiber_id = %self.id, "fiber observer panicked");
            }
        }
    }

    // =========================================================================
    // Fork and race
    // =========================================================================

    fn fork(
        self: &Arc<Self>,
        rs: &RunState,
        config: &Arc<RuntimeConfig>,
        effect: Instr,
        scope: Option<Arc<dyn ForkScope>>,
        location: &'static Location<'static>,
    ) -> RuntimeFiber {
        let scope = scope
            .or_else(|| rs.fork_scope_override())
            .unwrap_or_else(|| Arc::new(LocalScope::new(self)));
        let child_refs = self.refs_snapshot().fork();
        let child = Arc::new(Self::new(
            FiberId::next(),
            child_refs,
            Arc::clone(config),
            scope.fiber_id(),
        ));
        let handle = RuntimeFiber::new(Arc::clone(&child));

        let child_rs = RunState::new(rs.is_interruptible(), rs.supervisors.clone(), config.trace_depth);
        let refs = child.refs_snapshot();
        child.supervise(config, &child_rs.supervisors, "on_start", |s| {
            s.on_start(&refs, Some(self.id), &handle);
        });
        config.metrics.record_fork(location);
        trace!(parent = %self.id, child = %child.id, scope = %scope.fiber_id(), "fiber forked");

        let first = if scope.add(config, &handle) {
            effect
        } else {
            Instr::fail_cause(Cause::interrupt(scope.fiber_id()))
        };
        child.start(config, child_rs, first);
        handle
    }

    fn race_with(self: &Arc<Self>, rs: &RunState, config: &Arc<RuntimeConfig>, race: RaceWith) -> Instr {
        let RaceWith {
            left,
            right,
            left_wins,
            right_wins,
            scope,
            location,
        } = race;
        let left = self.fork(rs, config, left.into_instr().interruptible(), scope.clone(), location);
        let right = self.fork(rs, config, right.into_instr().interruptible(), scope, location);
        let parent_id = self.id;
        let blocking_on = left.id();

        Instr::Async {
            blocking_on,
            register: Box::new(move |resume: AsyncResume| {
                let undecided = Arc::new(AtomicBool::new(true));
                let canceler = left
                    .context()
                    .interrupt_as(parent_id)
                    .then(right.context().interrupt_as(parent_id));
                arbitrate(&left, &right, left_wins, &undecided, &resume);
                arbitrate(&right, &left, right_wins, &undecided, &resume);
                Registration::Suspended(Some(canceler))
            }),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn current_scope(self: &Arc<Self>, rs: &RunState) -> Arc<dyn ForkScope> {
        rs.fork_scope_override()
            .unwrap_or_else(|| Arc::new(LocalScope::new(self)))
    }

    fn descriptor(&self, rs: &RunState) -> Descriptor {
        let state = self.state.lock();
        Descriptor {
            id: self.id,
            status: state.status(),
            interruptors: state.interruptors(),
            interruptible: rs.is_interruptible(),
            scope_id: self.scope_id,
        }
    }

    fn log(
        &self,
        rs: &RunState,
        config: &RuntimeConfig,
        level: LogLevel,
        message: String,
        cause: Option<AnyCause>,
    ) {
        let refs = self.refs_snapshot();
        let record = LogRecord {
            fiber_id: self.id,
            level,
            message,
            cause,
            trace: rs.capture_trace(self.id),
            annotations: logger::annotations().get_from(&refs),
            refs,
        };
        logger::emit(config.logger.as_ref(), &record);
    }

    /// Runs a hook on every effective supervisor. A panicking hook is
    /// reported as fatal and the fiber carries on.
    fn supervise(
        &self,
        config: &RuntimeConfig,
        layered: &[Arc<dyn Supervisor>],
        hook: &'static str,
        f: impl Fn(&dyn Supervisor),
    ) {
        for supervisor in config.supervisor.iter().chain(layered) {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(supervisor.as_ref())));
            if let Err(payload) = result {
                self.report_fatal(
                    config,
                    FatalError::SupervisorPanic {
                        fiber_id: self.id,
                        hook,
                        defect: Defect::from_panic(&*payload),
                    },
                );
            }
        }
    }

    fn report_fatal(&self, config: &RuntimeConfig, fatal_error: FatalError) {
        error!(fiber_id = %self.id, error = %fatal_error, "fatal error in fiber");
        fatal::mark_catastrophic();
        let report = Arc::clone(&config.report_fatal);
        if panic::catch_unwind(AssertUnwindSafe(|| report(&fatal_error))).is_err() {
            eprintln!("fibra: fatal error hook panicked while reporting: {fatal_error}");
        }
    }
}

/// Pushes the frames that run a finalizer uninterruptibly and then apply
/// `restore` while still uninterruptible.
fn push_finalizer_region(rs: &mut RunState, restore: Frame) {
    rs.push_interrupt_status(false);
    rs.stack.push(restore);
}

/// Restores a fiber ref binding saved by `FiberRefLocally`.
fn restore_ref(key: Arc<FiberRefKey>, previous: Option<AnyValue>) -> Instr {
    Instr::FiberRefModifyAll(Box::new(move |_, mut refs: FiberRefs| {
        match previous {
            Some(value) => refs.set(&key, value),
            None => refs.remove(&key),
        }
        (unit(), refs)
    }))
}

/// Wires one side of a race: the first side to complete flips `undecided`
/// and resumes the racing fiber with its handler.
fn arbitrate(
    side: &RuntimeFiber,
    other: &RuntimeFiber,
    wins: RaceCont,
    undecided: &Arc<AtomicBool>,
    resume: &AsyncResume,
) {
    let winner = side.clone();
    let loser = other.clone();
    let undecided = Arc::clone(undecided);
    let resume = resume.clone();
    side.context().add_observer(Box::new(move |exit: AnyExit| {
        if undecided.swap(false, Ordering::AcqRel) {
            let next = if exit.is_success() {
                inherit_refs(winner.context().refs_snapshot()).then(wins(exit, loser))
            } else {
                wins(exit, loser)
            };
            resume.resume(next);
        }
    }));
}
