//! Timer thread for deadline management.
//!
//! One background thread sleeps until the earliest registered deadline and
//! then runs the callbacks that are due. Callbacks must be short: the ones
//! registered by [`Effect::sleep`](crate::Effect::sleep) only hand the fiber
//! back to the scheduler.
//!
//! Cancellation is lazy. A cancelled entry stays in the heap until its
//! deadline passes or the heap is compacted, but its callback is dropped
//! right away.

use super::scheduler::Task;
use crate::tracing_compat::{debug, error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Heap size below which cancelled entries are never compacted.
const COMPACT_THRESHOLD: usize = 64;

/// A timer entry in the heap.
#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    key: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of deadlines plus the callbacks still live.
#[derive(Default)]
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, Task>,
    next_key: u64,
    shutdown: bool,
}

impl TimerHeap {
    fn insert(&mut self, deadline: Instant, task: Task) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.heap.push(TimerEntry { deadline, key });
        self.callbacks.insert(key, task);
        key
    }

    fn cancel(&mut self, key: u64) -> bool {
        let removed = self.callbacks.remove(&key).is_some();
        if removed
            && self.heap.len() > COMPACT_THRESHOLD
            && self.heap.len() > 2 * self.callbacks.len()
        {
            let callbacks = &self.callbacks;
            self.heap.retain(|entry| callbacks.contains_key(&entry.key));
        }
        removed
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every live callback whose deadline is at or before `now`.
    fn pop_expired(&mut self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let key = entry.key;
            self.heap.pop();
            if let Some(task) = self.callbacks.remove(&key) {
                expired.push(task);
            }
        }
        expired
    }
}

struct TimerShared {
    state: Mutex<TimerHeap>,
    cvar: Condvar,
}

impl TimerShared {
    fn run(&self) {
        debug!("timer thread started");
        let mut state = self.state.lock();
        while !state.shutdown {
            let due = state.pop_expired(Instant::now());
            if !due.is_empty() {
                trace!(fired = due.len(), "timers fired");
                MutexGuard::unlocked(&mut state, || {
                    for task in due {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!("timer callback panicked");
                        }
                    }
                });
                continue;
            }
            match state.peek_deadline() {
                Some(deadline) => {
                    let _ = self.cvar.wait_until(&mut state, deadline);
                }
                None => self.cvar.wait(&mut state),
            }
        }
        debug!("timer thread stopped");
    }
}

/// A background thread that runs callbacks at deadlines.
pub struct Timer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Spawns the timer thread.
    pub(crate) fn start(thread_name: String) -> io::Result<Arc<Self>> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerHeap::default()),
            cvar: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())?;
        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Runs `callback` on the timer thread once `deadline` has passed.
    /// Returns the key that cancels it.
    pub fn schedule(&self, deadline: Instant, callback: Box<dyn FnOnce() + Send>) -> u64 {
        let mut state = self.shared.state.lock();
        let wake = state.peek_deadline().map_or(true, |first| deadline < first);
        let key = state.insert(deadline, callback);
        drop(state);
        if wake {
            self.shared.cvar.notify_one();
        }
        key
    }

    /// Drops the callback registered under `key`. Returns false if it
    /// already ran or was cancelled.
    pub fn cancel(&self, key: u64) -> bool {
        self.shared.state.lock().cancel(key)
    }

    /// Callbacks registered and not yet run or cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stops the timer thread and drops every pending callback.
    pub fn shutdown(&self) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            std::mem::take(&mut state.callbacks)
        };
        self.shared.cvar.notify_all();
        drop(pending);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}
