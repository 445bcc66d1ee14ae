//! Runtime builder.
//!
//! ```rust,ignore
//! let runtime = RuntimeBuilder::multi_thread()
//!     .worker_threads(4)
//!     .thread_name_prefix("app")
//!     .max_ops(1024)
//!     .build()?;
//! ```

use crate::error::{Error, FatalError};
use crate::fiber_ref::FiberRefs;
use crate::logger::{FiberLogger, LogLevel, TracingLogger};
use crate::metrics::FiberMetrics;
use crate::runtime::config::{FatalPredicate, FatalReporter, RuntimeConfig, RuntimeSettings};
use crate::runtime::env_config::apply_env_overrides;
use crate::runtime::scheduler::worker::PoolOptions;
use crate::runtime::scheduler::{Scheduler, WorkerPool};
use crate::runtime::timer::Timer;
use crate::runtime::Runtime;
use crate::supervisor::Supervisor;
use crate::tracing_compat::debug;
use crate::types::Defect;
use std::sync::Arc;

/// Builder for constructing a runtime with custom configuration.
#[derive(Clone)]
pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    supervisor: Option<Arc<dyn Supervisor>>,
    logger: Option<Arc<dyn FiberLogger>>,
    report_fatal: Option<FatalReporter>,
    is_fatal: Option<FatalPredicate>,
    refs: FiberRefs,
}

impl RuntimeBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: RuntimeSettings::default(),
            supervisor: None,
            logger: None,
            report_fatal: None,
            is_fatal: None,
            refs: FiberRefs::new(),
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.settings.worker_threads = n;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.settings.thread_stack_size = size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.thread_name_prefix = prefix.into();
        self
    }

    /// Set how many batched tasks a worker runs before spilling.
    #[must_use]
    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.settings.batch_limit = limit;
        self
    }

    /// Set the operation budget of one fiber slice.
    #[must_use]
    pub fn max_ops(mut self, ops: usize) -> Self {
        self.settings.max_ops = ops;
        self
    }

    /// Set the execution-trace depth. 0 disables tracing.
    #[must_use]
    pub fn trace_depth(mut self, depth: usize) -> Self {
        self.settings.trace_depth = depth;
        self
    }

    /// Set the nesting depth up to which forked children start inline.
    #[must_use]
    pub fn eager_fork_depth(mut self, depth: usize) -> Self {
        self.settings.eager_fork_depth = depth;
        self
    }

    /// Set how many mailbox drains a completing fiber may perform.
    #[must_use]
    pub fn mailbox_drain_limit(mut self, limit: usize) -> Self {
        self.settings.mailbox_drain_limit = limit;
        self
    }

    /// Set the level used to log failures nobody observes.
    #[must_use]
    pub fn unhandled_log_level(mut self, level: LogLevel) -> Self {
        self.settings.unhandled_log_level = level;
        self
    }

    /// Enable or disable the thread-local current fiber.
    #[must_use]
    pub fn enable_current_fiber(mut self, enable: bool) -> Self {
        self.settings.enable_current_fiber = enable;
        self
    }

    /// Install a runtime-wide supervisor.
    #[must_use]
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replace the default [`TracingLogger`] sink.
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn FiberLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Register a callback for fatal engine errors.
    #[must_use]
    pub fn report_fatal<F>(mut self, f: F) -> Self
    where
        F: Fn(&FatalError) + Send + Sync + 'static,
    {
        self.report_fatal = Some(Arc::new(f));
        self
    }

    /// Classify caught panics: a panic for which `f` returns true aborts the
    /// fiber through the fatal path instead of becoming a defect.
    #[must_use]
    pub fn is_fatal<F>(mut self, f: F) -> Self
    where
        F: Fn(&Defect) -> bool + Send + Sync + 'static,
    {
        self.is_fatal = Some(Arc::new(f));
        self
    }

    /// Set the fiber refs every root fiber starts with.
    #[must_use]
    pub fn fiber_refs(mut self, refs: FiberRefs) -> Self {
        self.refs = refs;
        self
    }

    /// Apply `FIBRA_*` environment overrides. Builder calls made afterwards
    /// take precedence over the environment.
    pub fn with_env_overrides(mut self) -> Result<Self, Error> {
        apply_env_overrides(&mut self.settings)?;
        Ok(self)
    }

    /// The settings this builder will start a runtime with.
    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Start the worker and timer threads and build the runtime.
    pub fn build(self) -> Result<Runtime, Error> {
        let mut settings = self.settings;
        settings.normalize();

        let pool = WorkerPool::start(&PoolOptions {
            workers: settings.worker_threads,
            thread_name_prefix: settings.thread_name_prefix.clone(),
            thread_stack_size: settings.thread_stack_size,
            batch_limit: settings.batch_limit,
        })?;
        let timer = match Timer::start(format!("{}-timer", settings.thread_name_prefix)) {
            Ok(timer) => timer,
            Err(err) => {
                pool.shutdown();
                return Err(err.into());
            }
        };

        let config = RuntimeConfig {
            scheduler: Arc::clone(&pool) as Arc<dyn Scheduler>,
            timer: Arc::clone(&timer),
            supervisor: self.supervisor,
            logger: self
                .logger
                .unwrap_or_else(|| Arc::new(TracingLogger) as Arc<dyn FiberLogger>),
            metrics: Arc::new(FiberMetrics::new()),
            report_fatal: self
                .report_fatal
                .unwrap_or_else(RuntimeConfig::default_report_fatal),
            is_fatal: self.is_fatal.unwrap_or_else(RuntimeConfig::default_is_fatal),
            max_ops: settings.max_ops,
            trace_depth: settings.trace_depth,
            eager_fork_depth: settings.eager_fork_depth,
            mailbox_drain_limit: settings.mailbox_drain_limit,
            unhandled_log_level: settings.unhandled_log_level,
            enable_current_fiber: settings.enable_current_fiber,
        };
        debug!(
            workers = settings.worker_threads,
            max_ops = settings.max_ops,
            trace_depth = settings.trace_depth,
            "runtime started"
        );
        Ok(Runtime::from_parts(Arc::new(config), pool, timer, self.refs))
    }

    /// Single worker thread.
    #[must_use]
    pub fn current_thread() -> Self {
        Self::new().worker_threads(1)
    }

    /// One worker per available CPU.
    #[must_use]
    pub fn multi_thread() -> Self {
        Self::new()
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::fiber_ref::FiberRef;
    use crate::test_utils::init_test_logging;
    use crate::types::Exit;

    #[test]
    fn test_presets() {
        init_test_logging();
        crate::test_phase!("test_presets");
        assert_eq!(RuntimeBuilder::current_thread().settings().worker_threads, 1);
        assert_eq!(
            RuntimeBuilder::multi_thread().settings().worker_threads,
            RuntimeSettings::default_worker_threads()
        );
        crate::test_complete!("test_presets");
    }

    #[test]
    fn test_built_config_reflects_builder() {
        init_test_logging();
        let runtime = RuntimeBuilder::current_thread()
            .max_ops(16)
            .trace_depth(0)
            .eager_fork_depth(0)
            .mailbox_drain_limit(4)
            .unhandled_log_level(LogLevel::Warn)
            .build()
            .expect("runtime");
        let config = runtime.config();
        crate::assert_with_log!(config.max_ops == 16, "max_ops", 16, config.max_ops);
        assert_eq!(config.trace_depth, 0);
        assert_eq!(config.eager_fork_depth, 0);
        assert_eq!(config.mailbox_drain_limit, 4);
        assert_eq!(config.unhandled_log_level, LogLevel::Warn);
        assert!(config.supervisor.is_none());
    }

    #[test]
    fn test_zero_values_are_normalized() {
        init_test_logging();
        let runtime = RuntimeBuilder::new()
            .worker_threads(0)
            .max_ops(0)
            .batch_limit(0)
            .build()
            .expect("runtime");
        assert_eq!(runtime.config().max_ops, 1);
        assert_eq!(runtime.run_blocking(Effect::<i32, ()>::succeed(1)), Exit::Success(1));
    }

    #[test]
    fn test_initial_fiber_refs_reach_root_fibers() {
        init_test_logging();
        let tenant = FiberRef::make("none");
        let mut refs = FiberRefs::new();
        refs.insert(&tenant, "acme");
        let runtime = RuntimeBuilder::current_thread()
            .fiber_refs(refs)
            .build()
            .expect("runtime");
        assert_eq!(runtime.run_blocking(tenant.get::<()>()), Exit::Success("acme"));
    }

    #[test]
    fn test_custom_is_fatal_routes_panics_to_reporter() {
        init_test_logging();
        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let runtime = RuntimeBuilder::current_thread()
            .is_fatal(|defect| defect.message().contains("fatal"))
            .report_fatal(move |error| sink.lock().push(error.to_string()))
            .build()
            .expect("runtime");

        let survivable = Effect::<i32, ()>::succeed_with(|| panic!("ordinary"));
        assert!(matches!(runtime.run_blocking(survivable), Exit::Failure(_)));
        assert!(reported.lock().is_empty());

        let fatal = Effect::<i32, ()>::succeed_with(|| panic!("fatal condition"));
        let fiber = runtime.run_async(fatal);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while reported.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(reported.lock().len(), 1);
        assert!(reported.lock()[0].contains("fatal condition"));
        assert!(
            !fiber.runtime_fiber().is_done(),
            "a fatal error aborts the loop without an exit"
        );
    }
}
