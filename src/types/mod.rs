//! Core value types shared by the engine and the public surface.
//!
//! - [`id`]: fiber identifiers
//! - [`cause`]: structured failure causes and defects
//! - [`exit`]: terminal outcome of a fiber
//! - [`trace`]: execution traces attached to failures
//! - [`value`]: type-erased values carried through the interpreter

pub mod cause;
pub mod exit;
pub mod id;
pub mod trace;
pub mod value;

pub use cause::{Cause, Defect};
pub use exit::{AnyExit, Exit};
pub use id::FiberId;
pub use trace::Trace;
pub use value::{AnyValue, DynValue, Value};

/// A cause with an erased error type.
pub type AnyCause = Cause<AnyValue>;
