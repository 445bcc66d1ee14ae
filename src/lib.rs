//! Fibra: a fiber execution engine for Rust.
//!
//! # Overview
//!
//! Programs are values. An [`Effect<A, E>`](Effect) describes a computation
//! that may succeed with an `A`, fail with an `E`, die with a defect or be
//! interrupted. Nothing runs until a [`Runtime`] interprets the effect on a
//! *fiber*: a lightweight thread of execution with its own continuation
//! stack, interrupt status and dynamic variables.
//!
//! # Core Guarantees
//!
//! - **Stack safety**: the interpreter is a trampoline; arbitrarily deep
//!   `flat_map` chains and unwinds never grow the native stack
//! - **Structured interruption**: interruption is delivered only at safe
//!   points, deferred inside uninterruptible regions, and finalizers always
//!   run
//! - **Full causes**: failures keep every concurrent and sequential error,
//!   defect and interruption that contributed to them
//! - **Supervision**: forked children belong to their parent's scope and
//!   are interrupted when it finishes
//! - **Fair scheduling**: every fiber yields after a bounded number of
//!   operations
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, causes, exits, traces
//! - [`effect`]: the typed program surface and its instruction set
//! - [`fiber`]: fiber state, the interpreter loop and fiber handles
//! - [`fiber_ref`]: fiber-scoped dynamic variables
//! - [`supervisor`]: lifecycle hooks
//! - [`logger`]: fiber-aware logging
//! - [`metrics`]: fiber counters and histograms
//! - [`runtime`]: entry points, configuration, scheduler and timer
//! - [`error`]: error types
//!
//! # Example
//!
//! ```rust,ignore
//! use fibra::{Effect, Exit, RuntimeBuilder};
//! use std::time::Duration;
//!
//! let runtime = RuntimeBuilder::multi_thread().build()?;
//! let slow = Effect::<u32, String>::succeed(1).delay(Duration::from_millis(50));
//! let fast = Effect::<u32, String>::succeed(2);
//! assert_eq!(runtime.run_blocking(slow.race(fast)), Exit::Success(2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::type_complexity)]

pub mod effect;
pub mod error;
pub mod fiber;
pub mod fiber_ref;
pub mod logger;
pub mod metrics;
pub mod runtime;
pub mod supervisor;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use effect::{AsyncCallback, AsyncRegistration, Effect, Restorer};
pub use error::{Error, FatalError, FiberFailure, Result};
pub use fiber::{current_fiber_id, Descriptor, Fiber, FiberStatus, ForkScope, GlobalScope, RuntimeFiber};
pub use fiber_ref::{FiberRef, FiberRefs};
pub use logger::{FiberLogger, LogLevel, LogRecord, TracingLogger};
pub use metrics::FiberMetrics;
pub use runtime::{Canceler, ExitFuture, Runtime, RuntimeBuilder, RuntimeConfig};
pub use supervisor::{Supervisor, Track};
pub use types::{Cause, Defect, Exit, FiberId, Trace, Value};
