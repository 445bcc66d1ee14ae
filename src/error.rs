//! Error types for fibra.
//!
//! Failures *inside* a fiber are values: they travel as a
//! [`Cause`](crate::types::Cause) and end up in an
//! [`Exit`](crate::types::Exit). The types here cover everything else:
//!
//! - [`Error`]: building or configuring a runtime failed
//! - [`FatalError`]: the engine itself hit a broken invariant. These never
//!   reach user code as a cause; they abort the affected fiber and are
//!   reported through [`RuntimeConfig::report_fatal`](crate::runtime::RuntimeConfig)
//! - [`FiberFailure`]: the failure cause of a root fiber, surfaced to
//!   callers of [`Runtime::run_future`](crate::runtime::Runtime::run_future)

use crate::types::{Cause, Defect, FiberId};
use std::fmt;
use std::io;

/// Errors raised while building a runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An environment override held an unparseable value.
    #[error("invalid value for {var}: {reason} (got {value:?})")]
    InvalidEnv {
        /// The environment variable.
        var: &'static str,
        /// The raw value found.
        value: String,
        /// What was expected.
        reason: &'static str,
    },

    /// A worker or timer thread could not be spawned.
    #[error("failed to spawn runtime thread: {0}")]
    ThreadSpawn(#[from] io::Error),
}

/// Convenience alias for runtime-construction results.
pub type Result<T> = std::result::Result<T, Error>;

/// An internal invariant violation inside the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FatalError {
    /// An async boundary registered its canceler twice.
    #[error("inconsistent state: async canceler registered twice on fiber {fiber_id}")]
    DoubleCancelerRegistration {
        /// The affected fiber.
        fiber_id: FiberId,
    },

    /// A typed continuation received a value of the wrong type.
    #[error("value type mismatch: expected {expected}")]
    TypeMismatch {
        /// The type the continuation expected.
        expected: &'static str,
    },

    /// A panic that the fatal predicate classified as unrecoverable.
    #[error("fatal defect in fiber {fiber_id}: {defect}")]
    FatalDefect {
        /// The affected fiber.
        fiber_id: FiberId,
        /// The panic converted to a defect.
        defect: Defect,
    },

    /// A supervisor hook panicked.
    #[error("supervisor hook {hook} panicked on fiber {fiber_id}: {defect}")]
    SupervisorPanic {
        /// The affected fiber.
        fiber_id: FiberId,
        /// Which hook.
        hook: &'static str,
        /// The panic converted to a defect.
        defect: Defect,
    },

    /// A fiber was resumed but its run state had not been parked.
    #[error("fiber {fiber_id} resumed without a parked run state")]
    MissingRunState {
        /// The affected fiber.
        fiber_id: FiberId,
    },
}

impl FatalError {
    /// The fiber the error was raised on, when known.
    #[must_use]
    pub const fn fiber_id(&self) -> Option<FiberId> {
        match self {
            Self::DoubleCancelerRegistration { fiber_id }
            | Self::FatalDefect { fiber_id, .. }
            | Self::SupervisorPanic { fiber_id, .. }
            | Self::MissingRunState { fiber_id } => Some(*fiber_id),
            Self::TypeMismatch { .. } => None,
        }
    }
}

/// The failure of a root fiber, as seen by a future-based caller.
#[derive(Clone, PartialEq)]
pub struct FiberFailure<E> {
    /// The full failure cause.
    pub cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    /// Wraps a cause.
    #[must_use]
    pub const fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// Returns true when the root fiber was only interrupted.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        self.cause.is_interrupted_only()
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure")
            .field("cause", &self.cause)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber failed: {}", self.cause)
    }
}

impl<E: fmt::Debug> std::error::Error for FiberFailure<E> {}
