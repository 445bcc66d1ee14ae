//! Test utilities for fibra.
//!
//! Shared helpers for unit tests:
//! - tracing-based logging initialization
//! - phase/section macros for readable test output
//! - runtime constructors that fail loudly
//! - a process-wide lock for tests that touch environment variables

use crate::effect::Effect;
use crate::runtime::{Runtime, RuntimeBuilder};
use crate::types::{Exit, Value};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that read or write `FIBRA_*` environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock()
}

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level. The first call wins.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// A single-worker runtime for unit tests.
#[must_use]
pub fn test_runtime() -> Runtime {
    init_test_logging();
    RuntimeBuilder::current_thread()
        .thread_name_prefix("fibra-test")
        .build()
        .expect("failed to build test runtime")
}

/// A multi-worker runtime for unit tests.
#[must_use]
pub fn test_runtime_with_workers(workers: usize) -> Runtime {
    init_test_logging();
    RuntimeBuilder::multi_thread()
        .worker_threads(workers)
        .thread_name_prefix("fibra-test")
        .build()
        .expect("failed to build test runtime")
}

/// Runs an effect to completion on a fresh single-worker runtime.
pub fn run<A: Value, E: Value>(effect: Effect<A, E>) -> Exit<A, E> {
    test_runtime().run_blocking(effect)
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that an exit succeeded with a specific value.
#[macro_export]
macro_rules! assert_exit_success {
    ($exit:expr, $expected:expr) => {
        match $exit {
            $crate::types::Exit::Success(v) => assert_eq!(v, $expected),
            other => unreachable!("expected Exit::Success({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that an exit failed purely by interruption.
#[macro_export]
macro_rules! assert_exit_interrupted {
    ($exit:expr) => {
        match $exit {
            ref exit @ $crate::types::Exit::Failure(_) if exit.is_interrupted_only() => {}
            other => unreachable!("expected interrupted exit, got {:?}", other),
        }
    };
}
