//! Terminal outcome of a fiber.

use super::cause::{Cause, Defect};
use super::id::FiberId;
use super::value::{downcast, erase, AnyValue, Value};

/// How a fiber ended: with a value, or with a [`Cause`].
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<A, E> {
    /// The computation produced a value.
    Success(A),
    /// The computation failed, died, or was interrupted.
    Failure(Cause<E>),
}

/// An exit with erased value and error types.
pub type AnyExit = Exit<AnyValue, AnyValue>;

impl<A, E> Exit<A, E> {
    /// A successful exit.
    #[must_use]
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// A typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// A defect.
    #[must_use]
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Failure(Cause::die(defect))
    }

    /// Interruption by `id`.
    #[must_use]
    pub const fn interrupt(id: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(id))
    }

    /// Returns true for [`Exit::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true for [`Exit::Failure`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true when the exit is a failure that involves interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(cause) if cause.is_interrupted())
    }

    /// Returns true when the exit failed purely because of interruption.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        matches!(self, Self::Failure(cause) if cause.is_interrupted_only())
    }

    /// The success value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&A> {
        match self {
            Self::Success(a) => Some(a),
            Self::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(c) => Some(c),
        }
    }

    /// Transforms the success value.
    #[must_use]
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(c) => Exit::Failure(c),
        }
    }

    /// Transforms typed failures.
    #[must_use]
    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Transforms the whole failure cause.
    #[must_use]
    pub fn map_cause<E2>(self, f: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<A, E2> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(c) => Exit::Failure(f(c)),
        }
    }

    /// Combines two exits. Values combine with `f`; when both failed the
    /// causes combine with `g`.
    #[must_use]
    pub fn zip_with<B, C>(
        self,
        that: Exit<B, E>,
        f: impl FnOnce(A, B) -> C,
        g: impl FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    ) -> Exit<C, E> {
        match (self, that) {
            (Self::Success(a), Exit::Success(b)) => Exit::Success(f(a, b)),
            (Self::Failure(l), Exit::Failure(r)) => Exit::Failure(g(l, r)),
            (Self::Failure(c), Exit::Success(_)) | (Self::Success(_), Exit::Failure(c)) => {
                Exit::Failure(c)
            }
        }
    }

    /// Converts into a `Result`, keeping the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(c) => Err(c),
        }
    }

    /// Builds an exit from a `Result` with a typed error.
    #[must_use]
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::Success(a),
            Err(e) => Self::fail(e),
        }
    }
}

impl<A: Value, E: Value> Exit<A, E> {
    pub(crate) fn erase(self) -> AnyExit {
        match self {
            Self::Success(a) => Exit::Success(erase(a)),
            Self::Failure(c) => Exit::Failure(c.map(erase)),
        }
    }

    pub(crate) fn from_erased(exit: AnyExit) -> Self {
        match exit {
            Exit::Success(v) => Self::Success(downcast(v)),
            Exit::Failure(c) => Self::Failure(c.map(downcast)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        let ok: Exit<i32, &str> = Exit::succeed(1);
        let failed: Exit<i32, &str> = Exit::fail("boom");
        let interrupted: Exit<i32, &str> = Exit::interrupt(FiberId::new_for_test(1));
        assert!(ok.is_success());
        assert!(failed.is_failure());
        assert!(!failed.is_interrupted());
        assert!(interrupted.is_interrupted_only());
    }

    #[test]
    fn zip_with_combines_causes() {
        let l: Exit<i32, &str> = Exit::fail("l");
        let r: Exit<i32, &str> = Exit::fail("r");
        let both = l.zip_with(r, |a, b| a + b, Cause::both);
        assert_eq!(both, Exit::Failure(Cause::fail("l").both(Cause::fail("r"))));

        let ok = Exit::<i32, &str>::succeed(1).zip_with(Exit::succeed(2), |a, b| a + b, Cause::then);
        assert_eq!(ok, Exit::Success(3));
    }

    #[test]
    fn erase_round_trip_through_engine_types() {
        let exit: Exit<String, u8> = Exit::fail(7);
        let back: Exit<String, u8> = Exit::from_erased(exit.clone().erase());
        assert_eq!(back, exit);
    }

    #[test]
    fn result_conversions() {
        let exit: Exit<i32, String> = Exit::from_result(Err("bad".into()));
        assert_eq!(exit.into_result(), Err(Cause::fail("bad".to_string())));
    }
}
