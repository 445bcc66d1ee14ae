//! Worker threads.
//!
//! A [`WorkerPool`] runs tasks on a fixed set of OS threads that share one
//! [`GlobalQueue`]. Each worker also keeps a thread-local batch: a task
//! submitted with [`Scheduler::schedule_task`] from inside a worker of the
//! same pool is queued on that worker and runs right after the current task,
//! which keeps resumption cheap and the native stack flat. After
//! `batch_limit` batched tasks in a row the worker spills the remainder to
//! the global queue and wakes a peer, so a long chain of resumptions cannot
//! monopolise a thread.

use super::{GlobalQueue, Scheduler, Task};
use crate::tracing_compat::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Identifier for a scheduler worker.
pub type WorkerId = usize;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL: RefCell<Option<LocalBatch>> = const { RefCell::new(None) };
}

/// Tasks batched on the current worker thread.
struct LocalBatch {
    pool_id: u64,
    tasks: VecDeque<Task>,
}

/// Thread-spawning options for a pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolOptions {
    pub(crate) workers: usize,
    pub(crate) thread_name_prefix: String,
    pub(crate) thread_stack_size: usize,
    pub(crate) batch_limit: usize,
}

struct Shared {
    id: u64,
    global: GlobalQueue,
    parker: Parker,
    shutdown: AtomicBool,
    batch_limit: usize,
}

impl Shared {
    fn inject(&self, task: Task) {
        self.global.push(task);
        self.parker.unpark();
    }

    fn run_worker(&self, worker: WorkerId) {
        LOCAL.with(|local| {
            *local.borrow_mut() = Some(LocalBatch {
                pool_id: self.id,
                tasks: VecDeque::new(),
            });
        });
        debug!(pool = self.id, worker_id = worker, "worker started");

        while !self.shutdown.load(Ordering::Acquire) {
            match self.global.pop() {
                Some(task) => self.run_slice(task),
                None => self.parker.park(),
            }
        }

        LOCAL.with(|local| local.borrow_mut().take());
        debug!(pool = self.id, worker_id = worker, "worker stopped");
    }

    /// Runs `task` and then the batch it produced, up to the batch limit.
    fn run_slice(&self, task: Task) {
        execute(task);
        let mut batched = 0_usize;
        while let Some(next) = pop_local() {
            if batched >= self.batch_limit {
                self.spill(next);
                return;
            }
            execute(next);
            batched += 1;
        }
    }

    fn spill(&self, first: Task) {
        let rest = LOCAL.with(|local| {
            local
                .borrow_mut()
                .as_mut()
                .map(|batch| mem::take(&mut batch.tasks))
                .unwrap_or_default()
        });
        trace!(pool = self.id, spilled = rest.len() + 1, "batch limit reached, spilling");
        self.global.push(first);
        for task in rest {
            self.global.push(task);
        }
        self.parker.unpark();
    }
}

fn pop_local() -> Option<Task> {
    LOCAL.with(|local| {
        local
            .borrow_mut()
            .as_mut()
            .and_then(|batch| batch.tasks.pop_front())
    })
}

fn execute(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("scheduled task panicked outside the fiber loop");
    }
}

/// The default scheduler: a fixed pool of worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns the worker threads.
    pub(crate) fn start(options: &PoolOptions) -> io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            global: GlobalQueue::new(),
            parker: Parker::new(),
            shutdown: AtomicBool::new(false),
            batch_limit: options.batch_limit,
        });
        let pool = Arc::new(Self {
            shared: Arc::clone(&shared),
            workers: options.workers,
            handles: Mutex::new(Vec::with_capacity(options.workers)),
        });

        for worker in 0..options.workers {
            let shared = Arc::clone(&shared);
            let mut builder =
                thread::Builder::new().name(format!("{}-{worker}", options.thread_name_prefix));
            if options.thread_stack_size > 0 {
                builder = builder.stack_size(options.thread_stack_size);
            }
            match builder.spawn(move || shared.run_worker(worker)) {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(pool)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Tasks waiting in the global queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.global.len()
    }

    /// Stops the workers and drops every queued task. Waits for the workers
    /// to exit unless called from one of them.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.parker.unpark_all(self.workers);
        let handles = mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                error!(pool = self.shared.id, "worker thread panicked");
            }
        }
        while self.shared.global.pop().is_some() {}
        debug!(pool = self.shared.id, "worker pool shut down");
    }
}

impl Scheduler for WorkerPool {
    fn schedule_task(&self, task: Task) {
        let mut task = Some(task);
        let _ = LOCAL.try_with(|local| {
            if let Ok(mut slot) = local.try_borrow_mut() {
                if let Some(batch) = slot.as_mut().filter(|b| b.pool_id == self.shared.id) {
                    if let Some(task) = task.take() {
                        batch.tasks.push_back(task);
                    }
                }
            }
        });
        if let Some(task) = task {
            self.shared.inject(task);
        }
    }

    fn schedule_fair(&self, task: Task) {
        self.shared.inject(task);
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.shared.id)
            .field("workers", &self.workers)
            .field("queued", &self.queued())
            .finish()
    }
}

/// A mechanism for parking and unparking idle workers.
///
/// Wake-ups are counted, so an unpark that arrives before the matching park
/// is not lost.
#[derive(Debug, Default)]
pub struct Parker {
    permits: Mutex<usize>,
    cvar: Condvar,
}

impl Parker {
    /// Creates a new parker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the current thread until a wake-up is available.
    pub fn park(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Parks the current thread with a timeout. Returns true when woken by
    /// an unpark.
    pub fn park_timeout(&self, duration: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            let _ = self.cvar.wait_for(&mut permits, duration);
        }
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Wakes one parked thread.
    pub fn unpark(&self) {
        {
            let mut permits = self.permits.lock();
            *permits = permits.saturating_add(1);
        }
        self.cvar.notify_one();
    }

    /// Wakes up to `count` parked threads.
    pub fn unpark_all(&self, count: usize) {
        {
            let mut permits = self.permits.lock();
            *permits = permits.saturating_add(count);
        }
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::mpsc;
    use std::time::Instant;

    fn options(workers: usize, batch_limit: usize) -> PoolOptions {
        PoolOptions {
            workers,
            thread_name_prefix: "fibra-pool-test".into(),
            thread_stack_size: 0,
            batch_limit,
        }
    }

    #[test]
    fn test_pool_runs_foreign_tasks() {
        init_test_logging();
        crate::test_phase!("test_pool_runs_foreign_tasks");
        let pool = WorkerPool::start(&options(2, 64)).expect("pool");
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.schedule_task(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let mut seen: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("task ran"))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        pool.shutdown();
        crate::test_complete!("test_pool_runs_foreign_tasks");
    }

    #[test]
    fn test_batched_tasks_run_after_current_in_order() {
        init_test_logging();
        let pool = WorkerPool::start(&options(1, 64)).expect("pool");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        let inner_pool = Arc::clone(&pool);
        let outer_log = Arc::clone(&log);
        pool.schedule_task(Box::new(move || {
            for i in 1..=3 {
                let log = Arc::clone(&outer_log);
                inner_pool.schedule_task(Box::new(move || log.lock().push(i)));
            }
            let tx = tx.clone();
            inner_pool.schedule_task(Box::new(move || {
                let _ = tx.send(());
            }));
            outer_log.lock().push(0);
        }));

        rx.recv_timeout(Duration::from_secs(5)).expect("batch drained");
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn test_batch_limit_spills_without_losing_tasks() {
        init_test_logging();
        let pool = WorkerPool::start(&options(1, 2)).expect("pool");
        let (tx, rx) = mpsc::channel();

        let inner_pool = Arc::clone(&pool);
        pool.schedule_task(Box::new(move || {
            for i in 0..10 {
                let tx = tx.clone();
                inner_pool.schedule_task(Box::new(move || {
                    let _ = tx.send(i);
                }));
            }
        }));

        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("task ran"))
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        init_test_logging();
        let pool = WorkerPool::start(&options(1, 8)).expect("pool");
        pool.schedule_task(Box::new(|| panic!("task blew up")));
        let (tx, rx) = mpsc::channel();
        pool.schedule_task(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        init_test_logging();
        let pool = WorkerPool::start(&options(2, 8)).expect("pool");
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.workers(), 2);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_parker_keeps_early_unpark() {
        let parker = Parker::new();
        parker.unpark();
        let start = Instant::now();
        parker.park();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!parker.park_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_parker_cross_thread_wake() {
        let parker = Arc::new(Parker::new());
        let remote = Arc::clone(&parker);
        let handle = thread::spawn(move || remote.park_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        parker.unpark();
        assert!(handle.join().expect("parked thread"));
    }
}
