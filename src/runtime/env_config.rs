//! Environment variable support for [`RuntimeBuilder`](super::builder::RuntimeBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods after
//!    `with_env_overrides()` (`worker_threads(4)`)
//! 2. **Environment variables**: values from `FIBRA_*` env vars
//! 3. **Defaults**: built-in defaults from [`RuntimeSettings::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `FIBRA_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `FIBRA_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `FIBRA_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `FIBRA_BATCH_LIMIT` | `usize` | `batch_limit` |
//! | `FIBRA_MAX_OPS` | `usize` | `max_ops` |
//! | `FIBRA_TRACE_DEPTH` | `usize` | `trace_depth` |
//! | `FIBRA_EAGER_FORK_DEPTH` | `usize` | `eager_fork_depth` |
//! | `FIBRA_MAILBOX_DRAIN_LIMIT` | `usize` | `mailbox_drain_limit` |
//! | `FIBRA_UNHANDLED_LOG_LEVEL` | level name | `unhandled_log_level` |
//! | `FIBRA_ENABLE_CURRENT_FIBER` | `bool` | `enable_current_fiber` |

use crate::error::Error;
use crate::logger::LogLevel;
use crate::runtime::config::RuntimeSettings;

/// Environment variable name for worker thread count.
pub const ENV_WORKER_THREADS: &str = "FIBRA_WORKER_THREADS";
/// Environment variable name for thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "FIBRA_THREAD_NAME_PREFIX";
/// Environment variable name for thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "FIBRA_THREAD_STACK_SIZE";
/// Environment variable name for the worker batch limit.
pub const ENV_BATCH_LIMIT: &str = "FIBRA_BATCH_LIMIT";
/// Environment variable name for the per-slice operation budget.
pub const ENV_MAX_OPS: &str = "FIBRA_MAX_OPS";
/// Environment variable name for the execution-trace depth.
pub const ENV_TRACE_DEPTH: &str = "FIBRA_TRACE_DEPTH";
/// Environment variable name for the eager fork-start depth.
pub const ENV_EAGER_FORK_DEPTH: &str = "FIBRA_EAGER_FORK_DEPTH";
/// Environment variable name for the completion mailbox drain limit.
pub const ENV_MAILBOX_DRAIN_LIMIT: &str = "FIBRA_MAILBOX_DRAIN_LIMIT";
/// Environment variable name for the unhandled-failure log level.
pub const ENV_UNHANDLED_LOG_LEVEL: &str = "FIBRA_UNHANDLED_LOG_LEVEL";
/// Environment variable name for the current-fiber toggle.
pub const ENV_ENABLE_CURRENT_FIBER: &str = "FIBRA_ENABLE_CURRENT_FIBER";

/// Apply environment variable overrides to [`RuntimeSettings`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(settings: &mut RuntimeSettings) -> Result<(), Error> {
    if let Some(val) = read_env(ENV_WORKER_THREADS) {
        settings.worker_threads = parse_usize(ENV_WORKER_THREADS, val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        settings.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        settings.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, val)?;
    }
    if let Some(val) = read_env(ENV_BATCH_LIMIT) {
        settings.batch_limit = parse_usize(ENV_BATCH_LIMIT, val)?;
    }
    if let Some(val) = read_env(ENV_MAX_OPS) {
        settings.max_ops = parse_usize(ENV_MAX_OPS, val)?;
    }
    if let Some(val) = read_env(ENV_TRACE_DEPTH) {
        settings.trace_depth = parse_usize(ENV_TRACE_DEPTH, val)?;
    }
    if let Some(val) = read_env(ENV_EAGER_FORK_DEPTH) {
        settings.eager_fork_depth = parse_usize(ENV_EAGER_FORK_DEPTH, val)?;
    }
    if let Some(val) = read_env(ENV_MAILBOX_DRAIN_LIMIT) {
        settings.mailbox_drain_limit = parse_usize(ENV_MAILBOX_DRAIN_LIMIT, val)?;
    }
    if let Some(val) = read_env(ENV_UNHANDLED_LOG_LEVEL) {
        settings.unhandled_log_level = parse_level(ENV_UNHANDLED_LOG_LEVEL, val)?;
    }
    if let Some(val) = read_env(ENV_ENABLE_CURRENT_FIBER) {
        settings.enable_current_fiber = parse_bool(ENV_ENABLE_CURRENT_FIBER, val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, value: String) -> Result<usize, Error> {
    value.trim().parse::<usize>().map_err(|_| Error::InvalidEnv {
        var,
        value,
        reason: "expected unsigned integer",
    })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, Error> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidEnv {
            var,
            value,
            reason: "expected bool (true/false/1/0/yes/no)",
        }),
    }
}

fn parse_level(var: &'static str, value: String) -> Result<LogLevel, Error> {
    let level = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ]
    .into_iter()
    .find(|level| value.trim().eq_ignore_ascii_case(level.as_str()));
    level.ok_or(Error::InvalidEnv {
        var,
        value,
        reason: "expected trace, debug, info, warn or error",
    })
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: [&str; 10] = [
        ENV_WORKER_THREADS,
        ENV_THREAD_NAME_PREFIX,
        ENV_THREAD_STACK_SIZE,
        ENV_BATCH_LIMIT,
        ENV_MAX_OPS,
        ENV_TRACE_DEPTH,
        ENV_EAGER_FORK_DEPTH,
        ENV_MAILBOX_DRAIN_LIMIT,
        ENV_UNHANDLED_LOG_LEVEL,
        ENV_ENABLE_CURRENT_FIBER,
    ];

    fn clean_env_locked() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    fn with_envs<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = crate::test_utils::env_lock();
        clean_env_locked();
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let result = f();
        clean_env_locked();
        result
    }

    // --- parse helpers ---

    #[test]
    fn parse_usize_valid() {
        assert_eq!(parse_usize("TEST", "42".into()).unwrap(), 42);
        assert_eq!(parse_usize("TEST", " 100 ".into()).unwrap(), 100);
        assert_eq!(parse_usize("TEST", "0".into()).unwrap(), 0);
    }

    #[test]
    fn parse_usize_invalid() {
        let err = parse_usize("TEST", "-1".into()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidEnv { var: "TEST", ref value, .. } if value == "-1"
        ));
    }

    #[test]
    fn parse_bool_variants() {
        for truthy in ["true", "1", "YES", " on "] {
            assert!(parse_bool("TEST", truthy.into()).unwrap(), "{truthy}");
        }
        for falsy in ["false", "0", "no", "OFF"] {
            assert!(!parse_bool("TEST", falsy.into()).unwrap(), "{falsy}");
        }
        assert!(parse_bool("TEST", "maybe".into()).is_err());
    }

    #[test]
    fn parse_level_names() {
        assert_eq!(parse_level("TEST", "warn".into()).unwrap(), LogLevel::Warn);
        assert_eq!(parse_level("TEST", "INFO".into()).unwrap(), LogLevel::Info);
        assert!(parse_level("TEST", "loud".into()).is_err());
    }

    // --- overrides ---

    #[test]
    fn env_overrides_apply() {
        crate::test_utils::init_test_logging();
        crate::test_phase!("env_overrides_apply");
        let settings = with_envs(
            &[
                (ENV_WORKER_THREADS, "3"),
                (ENV_THREAD_NAME_PREFIX, "custom"),
                (ENV_MAX_OPS, "64"),
                (ENV_TRACE_DEPTH, "0"),
                (ENV_EAGER_FORK_DEPTH, "2"),
                (ENV_UNHANDLED_LOG_LEVEL, "error"),
                (ENV_ENABLE_CURRENT_FIBER, "false"),
            ],
            || {
                let mut settings = RuntimeSettings::default();
                apply_env_overrides(&mut settings).expect("valid overrides");
                settings
            },
        );
        assert_eq!(settings.worker_threads, 3);
        assert_eq!(settings.thread_name_prefix, "custom");
        assert_eq!(settings.max_ops, 64);
        assert_eq!(settings.trace_depth, 0);
        assert_eq!(settings.eager_fork_depth, 2);
        assert_eq!(settings.unhandled_log_level, LogLevel::Error);
        assert!(!settings.enable_current_fiber);
        crate::test_complete!("env_overrides_apply");
    }

    #[test]
    fn env_unset_keeps_defaults() {
        let settings = with_envs(&[], || {
            let mut settings = RuntimeSettings::default();
            apply_env_overrides(&mut settings).expect("no overrides");
            settings
        });
        assert_eq!(settings, RuntimeSettings::default());
    }

    #[test]
    fn env_invalid_value_is_an_error() {
        let result = with_envs(&[(ENV_BATCH_LIMIT, "lots")], || {
            apply_env_overrides(&mut RuntimeSettings::default())
        });
        match result {
            Err(Error::InvalidEnv { var, value, .. }) => {
                assert_eq!(var, ENV_BATCH_LIMIT);
                assert_eq!(value, "lots");
            }
            other => unreachable!("expected InvalidEnv, got {other:?}"),
        }
    }
}
