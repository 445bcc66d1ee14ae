//! Runtime: the entry points that turn an [`Effect`] into a running fiber.
//!
//! A [`Runtime`] owns a worker pool, a timer thread, metrics and the
//! [`RuntimeConfig`] every fiber it starts runs under. Each entry point
//! starts a root fiber in the global scope with the runtime's initial fiber
//! refs and differs only in how the caller learns about the exit:
//!
//! | entry point | caller gets |
//! |---|---|
//! | [`Runtime::run_async`] | a [`Fiber`] handle; failures nobody observes are logged |
//! | [`Runtime::run_async_with`] | a callback with the [`Exit`] |
//! | [`Runtime::run_async_cancelable`] | a [`Canceler`] that interrupts and waits |
//! | [`Runtime::run_future`] / [`Runtime::run_future_exit`] | a `Future` |
//! | [`Runtime::run_blocking`] | the [`Exit`], blocking the calling thread |
//!
//! Dropping the last handle to a runtime stops its threads. Fibers still
//! running at that point never complete.

pub mod builder;
pub mod config;
pub mod env_config;
pub mod fatal;
pub mod scheduler;
pub mod timer;

pub use builder::RuntimeBuilder;
pub use config::{RuntimeConfig, RuntimeSettings};
pub use fatal::catastrophic_failure;
pub use scheduler::{Scheduler, Task};
pub use timer::Timer;

use crate::effect::Effect;
use crate::error::FiberFailure;
use crate::fiber::context::FiberContext;
use crate::fiber::current::current_fiber_id;
use crate::fiber::handle::{Fiber, RuntimeFiber};
use crate::fiber::state::Observer;
use crate::fiber_ref::FiberRefs;
use crate::metrics::FiberMetrics;
use crate::tracing_compat::{trace, warn};
use crate::types::{Exit, FiberId, Value};
use parking_lot::{Condvar, Mutex};
use scheduler::WorkerPool;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// A fiber runtime. Cheap to clone; clones share threads and metrics.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: Arc<RuntimeConfig>,
    pool: Arc<WorkerPool>,
    timer: Arc<Timer>,
    refs: FiberRefs,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.timer.shutdown();
        self.pool.shutdown();
    }
}

impl Runtime {
    pub(crate) fn from_parts(
        config: Arc<RuntimeConfig>,
        pool: Arc<WorkerPool>,
        timer: Arc<Timer>,
        refs: FiberRefs,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                pool,
                timer,
                refs,
            }),
        }
    }

    /// The configuration root fibers start with.
    #[must_use]
    pub fn config(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.inner.config)
    }

    /// Fiber metrics of this runtime.
    #[must_use]
    pub fn metrics(&self) -> Arc<FiberMetrics> {
        Arc::clone(&self.inner.config.metrics)
    }

    fn start<A: Value, E: Value>(
        &self,
        effect: Effect<A, E>,
        observer: Option<Observer>,
    ) -> Fiber<A, E> {
        let context = FiberContext::root(self.config(), self.inner.refs.clone());
        if let Some(observer) = observer {
            context.add_observer(observer);
        }
        trace!(fiber_id = %context.id(), "starting root fiber");
        FiberContext::start_root(&context, effect.into_instr());
        Fiber::from_runtime(RuntimeFiber::new(context))
    }

    /// Starts `effect` on a root fiber. If it fails and nothing else observes
    /// it, the failure is logged.
    pub fn run_async<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        self.start(effect, None)
    }

    /// Starts `effect` on a root fiber and calls `callback` with its exit.
    /// The callback runs on whichever thread completes the fiber.
    pub fn run_async_with<A, E, F>(&self, effect: Effect<A, E>, callback: F) -> Fiber<A, E>
    where
        A: Value,
        E: Value,
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        self.start(
            effect,
            Some(Box::new(move |exit| callback(Exit::from_erased(exit)))),
        )
    }

    /// Like [`Runtime::run_async_with`], returning a [`Canceler`] that can
    /// interrupt the fiber.
    pub fn run_async_cancelable<A, E, F>(&self, effect: Effect<A, E>, callback: F) -> Canceler<A, E>
    where
        A: Value,
        E: Value,
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        Canceler {
            runtime: self.clone(),
            fiber: self.run_async_with(effect, callback),
        }
    }

    /// Starts `effect` and returns a future resolving to its exit. The fiber
    /// runs whether or not the future is polled; dropping the future does not
    /// interrupt it.
    pub fn run_future_exit<A: Value, E: Value>(&self, effect: Effect<A, E>) -> ExitFuture<A, E> {
        let state = Arc::new(Mutex::new(FutureState {
            exit: None,
            waker: None,
        }));
        let completion = Arc::clone(&state);
        let fiber = self.run_async_with(effect, move |exit| {
            let waker = {
                let mut state = completion.lock();
                state.exit = Some(exit);
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        ExitFuture { state, fiber }
    }

    /// Starts `effect` and returns a future resolving to its value, or to a
    /// [`FiberFailure`] with the full cause.
    pub fn run_future<A: Value, E: Value>(
        &self,
        effect: Effect<A, E>,
    ) -> impl Future<Output = Result<A, FiberFailure<E>>> + Send + 'static {
        let exit = self.run_future_exit(effect);
        async move { exit.await.into_result().map_err(FiberFailure::new) }
    }

    /// Runs `effect` to completion, blocking the calling thread.
    ///
    /// Calling this from inside a fiber blocks a worker thread and can
    /// deadlock a runtime with a single worker.
    pub fn run_blocking<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        if let Some(fiber_id) = current_fiber_id() {
            warn!(fiber_id = %fiber_id, "run_blocking called from inside a fiber");
        }
        let slot = Arc::new(OneShot::new());
        let sender = Arc::clone(&slot);
        self.run_async_with(effect, move |exit| sender.complete(exit));
        slot.wait()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.inner.pool)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Interrupts a fiber started with [`Runtime::run_async_cancelable`].
pub struct Canceler<A, E> {
    runtime: Runtime,
    fiber: Fiber<A, E>,
}

impl<A: Value, E: Value> Canceler<A, E> {
    /// The id of the fiber this canceler interrupts.
    #[must_use]
    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Interrupts the fiber as `by` and blocks until it has finished,
    /// returning its exit. A fiber that already finished returns its exit
    /// unchanged.
    ///
    /// Blocks the calling thread, so calling it from a fiber running on a
    /// single-worker runtime never returns.
    pub fn cancel(self, by: FiberId) -> Exit<A, E> {
        match self.runtime.run_blocking(self.fiber.interrupt_as::<E>(by)) {
            Exit::Success(exit) => exit,
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }
}

impl<A, E> fmt::Debug for Canceler<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceler").field("fiber", &self.fiber).finish()
    }
}

struct FutureState<A, E> {
    exit: Option<Exit<A, E>>,
    waker: Option<Waker>,
}

/// Future resolving to the exit of a root fiber.
pub struct ExitFuture<A, E> {
    state: Arc<Mutex<FutureState<A, E>>>,
    fiber: Fiber<A, E>,
}

impl<A: Value, E: Value> ExitFuture<A, E> {
    /// The root fiber behind this future.
    #[must_use]
    pub fn fiber(&self) -> &Fiber<A, E> {
        &self.fiber
    }
}

impl<A, E> Future for ExitFuture<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        state.exit.take().map_or_else(
            || {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            },
            Poll::Ready,
        )
    }
}

impl<A, E> fmt::Debug for ExitFuture<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitFuture")
            .field("fiber", &self.fiber)
            .finish_non_exhaustive()
    }
}

/// A single-value slot that a waiting thread blocks on.
struct OneShot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> OneShot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut value = self.value.lock();
        loop {
            if let Some(value) = value.take() {
                return value;
            }
            self.ready.wait(&mut value);
        }
    }
}
