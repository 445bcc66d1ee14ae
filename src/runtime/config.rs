//! Runtime configuration types.
//!
//! Two layers:
//!
//! - [`RuntimeSettings`]: plain values chosen before the runtime starts
//!   (thread counts, names, interpreter limits). The
//!   [`RuntimeBuilder`](super::builder::RuntimeBuilder) edits these.
//! - [`RuntimeConfig`]: what every fiber actually reads while it runs: the
//!   live scheduler, timer, supervisor, logger and metrics plus the
//!   interpreter limits. It is shared as an `Arc` and a fiber can swap it
//!   for a region with [`Effect::with_runtime_config`](crate::Effect::with_runtime_config).
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"fibra-worker"` |
//! | `batch_limit` | 128 |
//! | `max_ops` | 2048 |
//! | `trace_depth` | 32 |
//! | `eager_fork_depth` | 8 |
//! | `mailbox_drain_limit` | 1024 |
//! | `unhandled_log_level` | `Debug` |
//! | `enable_current_fiber` | true |

use crate::error::FatalError;
use crate::logger::{FiberLogger, LogLevel};
use crate::metrics::FiberMetrics;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::timer::Timer;
use crate::supervisor::Supervisor;
use crate::types::Defect;
use std::fmt;
use std::sync::Arc;

/// Operations a fiber runs before yielding to its peers.
pub const DEFAULT_MAX_OPS: usize = 2048;
/// Execution points kept per fiber trace.
pub const DEFAULT_TRACE_DEPTH: usize = 32;
/// Nesting depth up to which forked children start inline.
pub const DEFAULT_EAGER_FORK_DEPTH: usize = 8;
/// Mailbox drains allowed while a fiber completes.
pub const DEFAULT_MAILBOX_DRAIN_LIMIT: usize = 1024;
/// Batched tasks a worker runs before spilling to the global queue.
pub const DEFAULT_BATCH_LIMIT: usize = 128;
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_THREAD_NAME_PREFIX: &str = "fibra-worker";

/// Hook invoked with every fatal engine error.
pub type FatalReporter = Arc<dyn Fn(&FatalError) + Send + Sync>;

/// Predicate deciding whether a caught panic is fatal instead of a defect.
pub type FatalPredicate = Arc<dyn Fn(&Defect) -> bool + Send + Sync>;

/// Values chosen before a runtime starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Number of worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Stack size per worker thread (default: 2MB).
    pub thread_stack_size: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Batched tasks a worker runs in a row before spilling.
    pub batch_limit: usize,
    /// Operations per fiber slice.
    pub max_ops: usize,
    /// Execution-trace ring size; 0 disables tracing.
    pub trace_depth: usize,
    /// Eager-start depth for forked children; 0 always schedules.
    pub eager_fork_depth: usize,
    /// Mailbox drains allowed during completion.
    pub mailbox_drain_limit: usize,
    /// Level for failures of fibers nobody observes.
    pub unhandled_log_level: LogLevel,
    /// Whether the thread-local current fiber is maintained.
    pub enable_current_fiber: bool,
}

impl RuntimeSettings {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        if self.batch_limit == 0 {
            self.batch_limit = 1;
        }
        if self.max_ops == 0 {
            self.max_ops = 1;
        }
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_ops: DEFAULT_MAX_OPS,
            trace_depth: DEFAULT_TRACE_DEPTH,
            eager_fork_depth: DEFAULT_EAGER_FORK_DEPTH,
            mailbox_drain_limit: DEFAULT_MAILBOX_DRAIN_LIMIT,
            unhandled_log_level: LogLevel::Debug,
            enable_current_fiber: true,
        }
    }
}

/// The configuration every fiber runs under.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Where fiber slices run.
    pub scheduler: Arc<dyn Scheduler>,
    /// Deadline callbacks for sleeping fibers.
    pub timer: Arc<Timer>,
    /// Runtime-wide supervisor, in addition to any `supervised` layers.
    pub supervisor: Option<Arc<dyn Supervisor>>,
    /// Sink for fiber log records.
    pub logger: Arc<dyn FiberLogger>,
    /// Fiber lifecycle metrics.
    pub metrics: Arc<FiberMetrics>,
    /// Called with every fatal engine error.
    pub report_fatal: FatalReporter,
    /// Classifies caught panics.
    pub is_fatal: FatalPredicate,
    /// Operations per fiber slice.
    pub max_ops: usize,
    /// Execution-trace ring size; 0 disables tracing.
    pub trace_depth: usize,
    /// Eager-start depth for forked children.
    pub eager_fork_depth: usize,
    /// Mailbox drains allowed during completion.
    pub mailbox_drain_limit: usize,
    /// Level for failures of fibers nobody observes.
    pub unhandled_log_level: LogLevel,
    /// Whether the thread-local current fiber is maintained.
    pub enable_current_fiber: bool,
}

impl RuntimeConfig {
    /// The default fatal reporter: writes the error to stderr.
    #[must_use]
    pub fn default_report_fatal() -> FatalReporter {
        Arc::new(|error: &FatalError| eprintln!("fibra: fatal error: {error}"))
    }

    /// The default fatal predicate: no panic is fatal.
    #[must_use]
    pub fn default_is_fatal() -> FatalPredicate {
        Arc::new(|_: &Defect| false)
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("timer", &self.timer)
            .field("supervisor", &self.supervisor.is_some())
            .field("max_ops", &self.max_ops)
            .field("trace_depth", &self.trace_depth)
            .field("eager_fork_depth", &self.eager_fork_depth)
            .field("mailbox_drain_limit", &self.mailbox_drain_limit)
            .field("unhandled_log_level", &self.unhandled_log_level)
            .field("enable_current_fiber", &self.enable_current_fiber)
            .finish_non_exhaustive()
    }
}
