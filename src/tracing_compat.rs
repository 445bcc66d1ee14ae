//! Diagnostics facade over the `tracing` crate.
//!
//! With the `tracing-integration` feature (on by default) the macros below are
//! the real `tracing` macros. Without it they expand to nothing, so the engine
//! can log fiber lifecycle events without forcing a subscriber on users.
//!
//! ```rust,ignore
//! use fibra::tracing_compat::{debug, trace};
//!
//! trace!(fiber_id = %id, "fiber started");
//! debug!(fiber_id = %id, cause = %cause, "unhandled failure");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, enabled, error, info, trace, warn, Level};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! Expansions used when tracing is compiled out.

    /// Compiled-out `trace!`.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// Compiled-out `debug!`.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// Compiled-out `info!`.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// Compiled-out `warn!`.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// Compiled-out `error!`.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    /// Compiled-out `enabled!`; nothing is ever enabled.
    #[macro_export]
    macro_rules! enabled {
        ($($arg:tt)*) => {
            false
        };
    }

    pub use crate::{debug, enabled, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

/// Stand-in for `tracing::Level` when tracing is compiled out.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level;

#[cfg(not(feature = "tracing-integration"))]
impl Level {
    /// Trace level.
    pub const TRACE: Self = Self;
    /// Debug level.
    pub const DEBUG: Self = Self;
    /// Info level.
    pub const INFO: Self = Self;
    /// Warn level.
    pub const WARN: Self = Self;
    /// Error level.
    pub const ERROR: Self = Self;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    #[test]
    fn macros_accept_fields() {
        init_test_logging();
        crate::test_phase!("macros_accept_fields");
        let fiber = crate::types::FiberId::new_for_test(7);
        trace!(fiber_id = %fiber, "trace message");
        debug!(count = 42, "debug with field");
        info!("info message");
        warn!(fiber_id = ?fiber, "warn message");
        error!("error message");
        let _ = Level::DEBUG;
        crate::test_complete!("macros_accept_fields");
    }
}
