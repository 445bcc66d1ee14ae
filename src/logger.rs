//! Fiber-aware logging.
//!
//! Log records produced by [`Effect::log`](crate::Effect::log) and by the
//! engine itself (unhandled fiber failures) are delivered to the runtime's
//! [`FiberLogger`]. Each record carries the emitting fiber, its trace and a
//! snapshot of its fiber refs, including the annotations set with
//! [`Effect::annotated`](crate::Effect::annotated).
//!
//! The default sink, [`TracingLogger`], turns records into `tracing` events.

use crate::fiber_ref::{FiberRef, FiberRefs};
use crate::tracing_compat::{debug, error, info, trace, warn};
use crate::types::{AnyCause, FiberId, Trace};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// Very fine-grained diagnostics.
    Trace,
    /// Diagnostics useful while debugging.
    #[default]
    Debug,
    /// Normal operational messages.
    Info,
    /// Something unexpected that the program recovered from.
    Warn,
    /// A failure.
    Error,
}

impl LogLevel {
    /// Lower-case name, as used in environment overrides.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log event emitted by a fiber.
#[derive(Clone)]
pub struct LogRecord {
    /// The emitting fiber.
    pub fiber_id: FiberId,
    /// Severity.
    pub level: LogLevel,
    /// The message.
    pub message: String,
    /// A failure cause attached to the record.
    pub cause: Option<AnyCause>,
    /// The fiber's execution trace at the time of logging.
    pub trace: Option<Trace>,
    /// Annotations in force for the fiber.
    pub annotations: BTreeMap<String, String>,
    /// Every fiber ref binding of the fiber.
    pub refs: FiberRefs,
}

impl fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecord")
            .field("fiber_id", &self.fiber_id)
            .field("level", &self.level)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .field("annotations", &self.annotations)
            .finish_non_exhaustive()
    }
}

/// A destination for fiber log records.
pub trait FiberLogger: Send + Sync {
    /// Handles one record. Called on the emitting fiber's thread.
    fn log(&self, record: &LogRecord);
}

/// Forwards records to `tracing` events at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl FiberLogger for TracingLogger {
    fn log(&self, record: &LogRecord) {
        let fiber_id = record.fiber_id;
        let cause = record.cause.as_ref().map(ToString::to_string);
        let annotations = &record.annotations;
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => trace!(fiber_id = %fiber_id, cause = ?cause, annotations = ?annotations, "{message}"),
            LogLevel::Debug => debug!(fiber_id = %fiber_id, cause = ?cause, annotations = ?annotations, "{message}"),
            LogLevel::Info => info!(fiber_id = %fiber_id, cause = ?cause, annotations = ?annotations, "{message}"),
            LogLevel::Warn => warn!(fiber_id = %fiber_id, cause = ?cause, annotations = ?annotations, "{message}"),
            LogLevel::Error => error!(fiber_id = %fiber_id, cause = ?cause, annotations = ?annotations, "{message}"),
        }
    }
}

/// Delivers `record` to `logger`. A panicking sink is contained; the
/// message then goes to stderr instead.
pub(crate) fn emit(logger: &dyn FiberLogger, record: &LogRecord) {
    if panic::catch_unwind(AssertUnwindSafe(|| logger.log(record))).is_err() {
        eprintln!(
            "fibra: logger panicked; [{}] fiber {}: {}",
            record.level, record.fiber_id, record.message
        );
    }
}

/// The built-in fiber ref holding log annotations.
pub fn annotations() -> &'static FiberRef<BTreeMap<String, String>> {
    static ANNOTATIONS: OnceLock<FiberRef<BTreeMap<String, String>>> = OnceLock::new();
    ANNOTATIONS.get_or_init(|| FiberRef::make(BTreeMap::new()))
}
