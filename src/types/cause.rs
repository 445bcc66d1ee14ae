//! Structured failure causes.
//!
//! A [`Cause`] describes everything that went wrong in a computation:
//!
//! - `Fail(e)`: a typed, expected failure that handlers may recover from
//! - `Die(defect)`: an unexpected defect such as a panic
//! - `Interrupt(id)`: the computation was interrupted by fiber `id`
//!
//! Causes compose sequentially (`Then`, one happened after the other, e.g. a
//! finalizer failed while unwinding a failure) and in parallel (`Both`, e.g.
//! both sides of a race failed). `Stackless` and `Traced` annotate a cause
//! without changing what it means.
//!
//! # Equality
//!
//! Two causes are equal when they describe the same failures in the same
//! arrangement. Annotations are ignored, `Empty` is the identity of both
//! compositions, and nested compositions of the same kind are flattened, so
//! `(a ; b) ; c == a ; (b ; c)`.

use super::id::FiberId;
use super::trace::Trace;
use super::value::{erase, AnyValue, Value};
use core::fmt;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

/// An unexpected failure: a panic or a typed error whose type was discarded.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
    payload: Option<AnyValue>,
}

impl Defect {
    /// Creates a defect with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            payload: None,
        }
    }

    /// Creates a defect that carries the original value.
    #[must_use]
    pub fn with_payload(message: impl Into<String>, payload: AnyValue) -> Self {
        Self {
            message: Arc::from(message.into()),
            payload: Some(payload),
        }
    }

    /// Converts a caught panic payload into a defect.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(defect) = payload.downcast_ref::<Self>() {
            return defect.clone();
        }
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        Self::new(message)
    }

    /// Returns the defect message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the value the defect was built from, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&AnyValue> {
        self.payload.as_ref()
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl Eq for Defect {}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({:?})", self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// The full story of why a computation did not succeed.
#[derive(Clone, Debug)]
pub enum Cause<E> {
    /// Nothing went wrong.
    Empty,
    /// A typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// A cause that should not pick up an execution trace.
    Stackless(Box<Cause<E>>, bool),
    /// A cause annotated with the trace of the fiber that raised it.
    Traced(Box<Cause<E>>, Trace),
}

impl<E> Cause<E> {
    /// The empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect.
    #[must_use]
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Die(defect.into())
    }

    /// Interruption by `id`.
    #[must_use]
    pub const fn interrupt(id: FiberId) -> Self {
        Self::Interrupt(id)
    }

    /// Sequential composition. `Empty` is the identity.
    #[must_use]
    pub fn then(self, that: Self) -> Self {
        match (self.is_empty(), that.is_empty()) {
            (true, _) => that,
            (_, true) => self,
            _ => Self::Then(Box::new(self), Box::new(that)),
        }
    }

    /// Parallel composition. `Empty` is the identity.
    #[must_use]
    pub fn both(self, that: Self) -> Self {
        match (self.is_empty(), that.is_empty()) {
            (true, _) => that,
            (_, true) => self,
            _ => Self::Both(Box::new(self), Box::new(that)),
        }
    }

    /// Attaches an execution trace.
    #[must_use]
    pub fn traced(self, trace: Trace) -> Self {
        Self::Traced(Box::new(self), trace)
    }

    /// Marks the cause as stackless.
    #[must_use]
    pub fn stackless(self, stackless: bool) -> Self {
        Self::Stackless(Box::new(self), stackless)
    }

    /// Sequential composition of one interruption per id.
    #[must_use]
    pub fn interrupted_by(ids: impl IntoIterator<Item = FiberId>) -> Self {
        ids.into_iter()
            .fold(Self::Empty, |acc, id| acc.then(Self::Interrupt(id)))
    }

    /// True when the cause carries no failure, defect or interruption.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each_leaf(&mut |_| empty = false);
        empty
    }

    /// True when at least one interruption is present.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(&mut |leaf| found |= matches!(leaf, Self::Interrupt(_)));
        found
    }

    /// True when the cause consists of interruptions and nothing else.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupted = false;
        let mut other = false;
        self.for_each_leaf(&mut |leaf| match leaf {
            Self::Interrupt(_) => interrupted = true,
            _ => other = true,
        });
        interrupted && !other
    }

    /// True when at least one typed failure is present.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(&mut |leaf| found |= matches!(leaf, Self::Fail(_)));
        found
    }

    /// True when at least one defect is present.
    #[must_use]
    pub fn is_die(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(&mut |leaf| found |= matches!(leaf, Self::Die(_)));
        found
    }

    /// Typed failures, left to right.
    #[must_use]
    pub fn failures(&self) -> Vec<E>
    where
        E: Clone,
    {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Self::Fail(e) = leaf {
                out.push(e.clone());
            }
        });
        out
    }

    /// The first typed failure, if any.
    #[must_use]
    pub fn failure_option(&self) -> Option<&E> {
        let mut first = None;
        self.for_each_leaf(&mut |leaf| {
            if first.is_none() {
                if let Self::Fail(e) = leaf {
                    first = Some(e);
                }
            }
        });
        first
    }

    /// Defects, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Self::Die(d) = leaf {
                out.push(d.clone());
            }
        });
        out
    }

    /// Every fiber that took part in interrupting this computation.
    #[must_use]
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.for_each_leaf(&mut |leaf| {
            if let Self::Interrupt(id) = leaf {
                out.insert(*id);
            }
        });
        out
    }

    /// Traces attached anywhere in the cause.
    #[must_use]
    pub fn traces(&self) -> Vec<Trace> {
        let mut out = Vec::new();
        self.collect_traces(&mut out);
        out
    }

    fn collect_traces(&self, out: &mut Vec<Trace>) {
        match self {
            Self::Traced(inner, trace) => {
                out.push(trace.clone());
                inner.collect_traces(out);
            }
            Self::Stackless(inner, _) => inner.collect_traces(out),
            Self::Then(a, b) | Self::Both(a, b) => {
                a.collect_traces(out);
                b.collect_traces(out);
            }
            _ => {}
        }
    }

    /// Transforms every typed failure.
    #[must_use]
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_leaves(&mut |e| Cause::Fail(f(e)))
    }

    /// Replaces every typed failure with a defect built by `f`, keeping
    /// interruptions, defects and structure.
    #[must_use]
    pub fn strip_failures_with<E2>(self, mut f: impl FnMut(E) -> Defect) -> Cause<E2> {
        self.map_leaves(&mut |e| Cause::Die(f(e)))
    }

    /// Replaces every typed failure with a defect carrying the failure value.
    #[must_use]
    pub fn strip_failures<E2>(self) -> Cause<E2>
    where
        E: Value,
    {
        self.strip_failures_with(|e| Defect::with_payload(format!("{e:?}"), erase(e)))
    }

    fn map_leaves<E2>(self, f: &mut impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => f(e),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(a, b) => Cause::Then(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            Self::Both(a, b) => Cause::Both(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            Self::Stackless(c, flag) => Cause::Stackless(Box::new(c.map_leaves(f)), flag),
            Self::Traced(c, trace) => Cause::Traced(Box::new(c.map_leaves(f)), trace),
        }
    }

    fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        match self {
            Self::Empty => {}
            Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => f(self),
            Self::Then(a, b) | Self::Both(a, b) => {
                a.for_each_leaf(f);
                b.for_each_leaf(f);
            }
            Self::Stackless(c, _) | Self::Traced(c, _) => c.for_each_leaf(f),
        }
    }

    /// True when the cause carries a trace or was marked stackless.
    pub(crate) fn is_annotated(&self) -> bool {
        matches!(self, Self::Traced(..) | Self::Stackless(..))
    }

    /// Structural equality with a custom comparison for typed failures.
    pub fn eq_with(&self, other: &Self, eq: &mut impl FnMut(&E, &E) -> bool) -> bool {
        shapes_eq(&self.shape(), &other.shape(), eq)
    }

    /// True when `that` appears as a component of this cause, comparing
    /// typed failures with `eq`. The empty cause is contained in every cause.
    pub fn contains_with(&self, that: &Self, eq: &mut impl FnMut(&E, &E) -> bool) -> bool {
        let target = that.shape();
        if matches!(target, Shape::Empty) {
            return true;
        }
        shape_contains(&self.shape(), &target, eq)
    }

    /// True when `that` appears as a component of this cause.
    #[must_use]
    pub fn contains(&self, that: &Self) -> bool
    where
        E: PartialEq,
    {
        self.contains_with(that, &mut |a, b| a == b)
    }

    fn shape(&self) -> Shape<'_, E> {
        match self {
            Self::Empty => Shape::Empty,
            Self::Fail(e) => Shape::Fail(e),
            Self::Die(d) => Shape::Die(d),
            Self::Interrupt(id) => Shape::Interrupt(*id),
            Self::Stackless(c, _) | Self::Traced(c, _) => c.shape(),
            Self::Then(a, b) => {
                let mut parts = Vec::new();
                push_then(&mut parts, a.shape());
                push_then(&mut parts, b.shape());
                collapse(parts, Shape::Then)
            }
            Self::Both(a, b) => {
                let mut parts = Vec::new();
                push_both(&mut parts, a.shape());
                push_both(&mut parts, b.shape());
                collapse(parts, Shape::Both)
            }
        }
    }
}

impl Cause<AnyValue> {
    /// Strips erased failures, keeping the failure value as defect payload.
    pub(crate) fn strip_erased(self) -> Self {
        self.strip_failures_with(|e| {
            Defect::with_payload(format!("failure discarded by interruption: {e:?}"), e)
        })
    }

    /// Containment on erased causes; failures compare by identity.
    pub(crate) fn contains_erased(&self, that: &Self) -> bool {
        self.contains_with(that, &mut super::value::same_value)
    }
}

/// Canonical form used for equality: annotations removed, `Empty` dropped
/// and same-kind compositions flattened.
enum Shape<'a, E> {
    Empty,
    Fail(&'a E),
    Die(&'a Defect),
    Interrupt(FiberId),
    Then(Vec<Shape<'a, E>>),
    Both(Vec<Shape<'a, E>>),
}

fn push_then<'a, E>(parts: &mut Vec<Shape<'a, E>>, shape: Shape<'a, E>) {
    match shape {
        Shape::Empty => {}
        Shape::Then(inner) => parts.extend(inner),
        other => parts.push(other),
    }
}

fn push_both<'a, E>(parts: &mut Vec<Shape<'a, E>>, shape: Shape<'a, E>) {
    match shape {
        Shape::Empty => {}
        Shape::Both(inner) => parts.extend(inner),
        other => parts.push(other),
    }
}

fn collapse<'a, E>(
    mut parts: Vec<Shape<'a, E>>,
    wrap: fn(Vec<Shape<'a, E>>) -> Shape<'a, E>,
) -> Shape<'a, E> {
    match parts.len() {
        0 => Shape::Empty,
        1 => parts.pop().unwrap_or(Shape::Empty),
        _ => wrap(parts),
    }
}

fn shapes_eq<E>(a: &Shape<'_, E>, b: &Shape<'_, E>, eq: &mut impl FnMut(&E, &E) -> bool) -> bool {
    match (a, b) {
        (Shape::Empty, Shape::Empty) => true,
        (Shape::Fail(x), Shape::Fail(y)) => eq(x, y),
        (Shape::Die(x), Shape::Die(y)) => x == y,
        (Shape::Interrupt(x), Shape::Interrupt(y)) => x == y,
        (Shape::Then(xs), Shape::Then(ys)) | (Shape::Both(xs), Shape::Both(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| shapes_eq(x, y, eq))
        }
        _ => false,
    }
}

fn shape_contains<E>(
    haystack: &Shape<'_, E>,
    needle: &Shape<'_, E>,
    eq: &mut impl FnMut(&E, &E) -> bool,
) -> bool {
    if shapes_eq(haystack, needle, eq) {
        return true;
    }
    match haystack {
        Shape::Then(parts) | Shape::Both(parts) => {
            parts.iter().any(|part| shape_contains(part, needle, eq))
        }
        _ => false,
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        self.eq_with(other, &mut |a, b| a == b)
    }
}

impl<E: Eq> Eq for Cause<E> {}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Fail(e) => write!(f, "Fail({e:?})"),
            Self::Die(d) => write!(f, "Die({d})"),
            Self::Interrupt(id) => write!(f, "Interrupt({id})"),
            Self::Then(a, b) => write!(f, "({a} ; {b})"),
            Self::Both(a, b) => write!(f, "({a} & {b})"),
            Self::Stackless(c, _) | Self::Traced(c, _) => fmt::Display::fmt(c, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn id(n: u64) -> FiberId {
        FiberId::new_for_test(n)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn empty_is_identity_for_composition() {
        init_test("empty_is_identity_for_composition");
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(Cause::Empty.then(c.clone()), c);
        assert_eq!(c.clone().both(Cause::Empty), c);
        assert!(matches!(Cause::<()>::Empty.then(Cause::Empty), Cause::Empty));
        crate::test_complete!("empty_is_identity_for_composition");
    }

    #[test]
    fn annotations_are_transparent() {
        init_test("annotations_are_transparent");
        let trace = Trace::new(id(1), Vec::new());
        let plain: Cause<i32> = Cause::fail(3);
        assert_eq!(plain.clone().traced(trace), plain);
        assert_eq!(plain.clone().stackless(true), plain);
        assert!(Cause::<i32>::Empty.traced(Trace::new(id(2), Vec::new())).is_empty());
        crate::test_complete!("annotations_are_transparent");
    }

    #[test]
    fn composition_is_associative() {
        init_test("composition_is_associative");
        let a: Cause<i32> = Cause::fail(1);
        let b = Cause::die("two");
        let c = Cause::interrupt(id(3));
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.clone().then(b.clone().then(c.clone()));
        assert_eq!(left, right);
        let left = a.clone().both(b.clone()).both(c.clone());
        let right = a.both(b.both(c));
        assert_eq!(left, right);
        crate::test_complete!("composition_is_associative");
    }

    #[test]
    fn then_and_both_differ() {
        let a: Cause<i32> = Cause::fail(1);
        let b: Cause<i32> = Cause::fail(2);
        assert_ne!(a.clone().then(b.clone()), a.both(b));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[test]
    fn interrupted_only() {
        init_test("interrupted_only");
        let only: Cause<i32> = Cause::interrupt(id(1)).both(Cause::interrupt(id(2)));
        assert!(only.is_interrupted_only());
        let mixed = only.clone().then(Cause::fail(1));
        assert!(mixed.is_interrupted());
        assert!(!mixed.is_interrupted_only());
        assert!(!Cause::<i32>::Empty.is_interrupted_only());
        crate::test_complete!("interrupted_only");
    }

    #[test]
    fn collects_leaves_in_order() {
        let cause: Cause<&str> = Cause::fail("a")
            .then(Cause::die("d"))
            .both(Cause::fail("b").then(Cause::interrupt(id(9))));
        assert_eq!(cause.failures(), vec!["a", "b"]);
        assert_eq!(cause.failure_option(), Some(&"a"));
        assert_eq!(cause.defects(), vec![Defect::new("d")]);
        assert_eq!(cause.interruptors().into_iter().collect::<Vec<_>>(), vec![id(9)]);
    }

    #[test]
    fn contains_component() {
        let inner: Cause<i32> = Cause::interrupt(id(4));
        let cause = Cause::fail(1).then(inner.clone());
        assert!(cause.contains(&inner));
        assert!(cause.contains(&Cause::Empty));
        assert!(!cause.contains(&Cause::fail(2)));
    }

    #[test]
    fn strip_failures_keeps_interrupts() {
        init_test("strip_failures_keeps_interrupts");
        let cause: Cause<String> = Cause::fail("typed".to_string()).then(Cause::interrupt(id(5)));
        let stripped: Cause<()> = cause.strip_failures();
        assert!(!stripped.is_failure());
        assert!(stripped.is_die());
        assert_eq!(stripped.interruptors().len(), 1);
        let defect = &stripped.defects()[0];
        assert_eq!(defect.message(), "\"typed\"");
        assert!(defect.payload().is_some());
        crate::test_complete!("strip_failures_keeps_interrupts");
    }

    #[test]
    fn map_transforms_failures() {
        let cause: Cause<i32> = Cause::fail(2).both(Cause::fail(3));
        assert_eq!(cause.map(|n| n * 10), Cause::fail(20).both(Cause::fail(30)));
    }

    #[test]
    fn defect_from_panic_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(Defect::from_panic(boxed.as_ref()).message(), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(Defect::from_panic(boxed.as_ref()).message(), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(17_u8);
        assert_eq!(Defect::from_panic(boxed.as_ref()).message(), "opaque panic payload");
    }

    #[test]
    fn display_renders_structure() {
        let cause: Cause<&str> = Cause::fail("x").then(Cause::interrupt(id(2)));
        assert_eq!(cause.to_string(), "(Fail(\"x\") ; Interrupt(#2))");
    }
}
