//! Type-erased values carried through the interpreter.
//!
//! The interpreter never sees concrete result or error types: every value
//! travels as an [`AnyValue`], a shared pointer to something that is `Any`,
//! `Debug` and thread-safe. The typed [`Effect`](crate::effect::Effect)
//! surface erases on the way in and downcasts on the way out.

use crate::error::FatalError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Bound for every value that can flow through a fiber.
///
/// Values are cloned when an exit is delivered to several observers, and are
/// formatted when an unhandled failure is logged.
pub trait Value: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Value for T {}

/// Object-safe view of a [`Value`].
pub trait DynValue: Any + fmt::Debug + Send + Sync {
    /// Borrows the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Converts the shared pointer into an `Any` pointer for downcasting.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + fmt::Debug + Send + Sync> DynValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A type-erased value.
pub type AnyValue = Arc<dyn DynValue>;

/// Erases a typed value.
#[must_use]
pub fn erase<T: Value>(value: T) -> AnyValue {
    Arc::new(value)
}

/// The erased unit value.
#[must_use]
pub fn unit() -> AnyValue {
    Arc::new(())
}

/// Recovers a typed value, returning `None` on a type mismatch.
#[must_use]
pub fn try_downcast<T: Value>(value: AnyValue) -> Option<T> {
    let any = value.into_any();
    match any.downcast::<T>() {
        Ok(arc) => Some(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => None,
    }
}

/// Recovers a typed value.
///
/// A mismatch means the typed surface produced an instruction whose result
/// type disagrees with its continuation. That is an engine bug, so it unwinds
/// with a [`FatalError`] payload which the interpreter reports through the
/// fatal hook.
pub(crate) fn downcast<T: Value>(value: AnyValue) -> T {
    match try_downcast::<T>(value) {
        Some(v) => v,
        None => std::panic::panic_any(FatalError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }),
    }
}

/// Compares two erased values by identity.
pub(crate) fn same_value(a: &AnyValue, b: &AnyValue) -> bool {
    Arc::ptr_eq(a, b)
}
