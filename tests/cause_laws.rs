//! Algebraic laws of [`Cause`].
//!
//! Sequential and parallel composition must be associative with `Empty` as
//! the identity, annotations must not affect equality, and stripping typed
//! failures must keep every interruption and defect.

#[macro_use]
mod common;

use common::*;
use fibra::{Cause, Defect, FiberId};
use proptest::prelude::*;

// ============================================================================
// Arbitrary Instance Generators
// ============================================================================

fn arb_fiber_id() -> impl Strategy<Value = FiberId> {
    (1u64..64).prop_map(FiberId::new_for_test)
}

fn arb_leaf() -> impl Strategy<Value = Cause<i32>> {
    prop_oneof![
        Just(Cause::empty()),
        (-100i32..100).prop_map(Cause::fail),
        "[a-z]{1,6}".prop_map(|msg| Cause::die(Defect::new(msg))),
        arb_fiber_id().prop_map(Cause::interrupt),
    ]
}

fn arb_cause() -> impl Strategy<Value = Cause<i32>> {
    arb_leaf().prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.then(b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.both(b)),
            (inner.clone(), any::<bool>()).prop_map(|(c, flag)| c.stackless(flag)),
        ]
    })
}

fn arb_nonempty_leaf() -> impl Strategy<Value = Cause<i32>> {
    prop_oneof![
        (-100i32..100).prop_map(Cause::fail),
        "[a-z]{1,6}".prop_map(|msg| Cause::die(Defect::new(msg))),
        arb_fiber_id().prop_map(Cause::interrupt),
    ]
}

// ============================================================================
// Composition
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(256))]

    #[test]
    fn then_is_associative(a in arb_cause(), b in arb_cause(), c in arb_cause()) {
        init_test_logging();
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn both_is_associative(a in arb_cause(), b in arb_cause(), c in arb_cause()) {
        init_test_logging();
        let left = a.clone().both(b.clone()).both(c.clone());
        let right = a.both(b.both(c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn empty_is_identity(a in arb_cause()) {
        init_test_logging();
        prop_assert_eq!(Cause::empty().then(a.clone()), a.clone());
        prop_assert_eq!(a.clone().then(Cause::empty()), a.clone());
        prop_assert_eq!(Cause::empty().both(a.clone()), a.clone());
        prop_assert_eq!(a.clone().both(Cause::empty()), a);
    }

    #[test]
    fn annotations_do_not_affect_equality(a in arb_cause(), flag in any::<bool>()) {
        init_test_logging();
        prop_assert_eq!(a.clone().stackless(flag), a);
    }

    #[test]
    fn composition_keeps_every_leaf(a in arb_cause(), b in arb_cause()) {
        init_test_logging();
        let combined = a.clone().then(b.clone());
        let mut expected = a.failures();
        expected.extend(b.failures());
        prop_assert_eq!(combined.failures(), expected);

        let mut interruptors = a.interruptors();
        interruptors.extend(b.interruptors());
        prop_assert_eq!(combined.interruptors(), interruptors);
        prop_assert_eq!(combined.is_empty(), a.is_empty() && b.is_empty());
    }

    #[test]
    fn composed_cause_contains_its_leaves(c in arb_cause(), leaf in arb_nonempty_leaf()) {
        init_test_logging();
        prop_assert!(c.clone().then(leaf.clone()).contains(&leaf));
        prop_assert!(leaf.clone().both(c.clone()).contains(&leaf));
        prop_assert!(c.contains(&c));
        prop_assert!(c.contains(&Cause::empty()));
    }
}

// ============================================================================
// Stripping
// ============================================================================

proptest! {
    #![proptest_config(test_proptest_config(256))]

    #[test]
    fn strip_failures_preserves_interruptors(c in arb_cause()) {
        init_test_logging();
        let failures = c.failures().len();
        let defects = c.defects().len();
        let interruptors = c.interruptors();
        let interrupted_only = c.is_interrupted_only();

        let stripped: Cause<String> = c.strip_failures();
        prop_assert!(!stripped.is_failure());
        prop_assert_eq!(stripped.interruptors(), interruptors);
        prop_assert_eq!(stripped.defects().len(), defects + failures);
        prop_assert_eq!(stripped.is_interrupted_only(), interrupted_only);
    }

    #[test]
    fn interrupted_by_is_interrupted_only(ids in prop::collection::btree_set(arb_fiber_id(), 1..6)) {
        init_test_logging();
        let cause: Cause<i32> = Cause::interrupted_by(ids.iter().copied());
        prop_assert!(cause.is_interrupted_only());
        prop_assert_eq!(cause.interruptors(), ids);
    }

    #[test]
    fn map_preserves_shape(c in arb_cause()) {
        init_test_logging();
        let doubled = c.clone().map(|e| i64::from(e) * 2);
        let expected: Vec<i64> = c.failures().into_iter().map(|e| i64::from(e) * 2).collect();
        prop_assert_eq!(doubled.failures(), expected);
        prop_assert_eq!(doubled.interruptors(), c.interruptors());
        prop_assert_eq!(doubled.defects(), c.defects());
    }
}

// ============================================================================
// Examples
// ============================================================================

#[test]
fn mixed_cause_is_not_interrupted_only() {
    init_test_logging();
    test_phase!("mixed_cause_is_not_interrupted_only");
    let id = FiberId::new_for_test(7);
    let cause: Cause<&str> = Cause::interrupt(id).both(Cause::fail("boom"));
    assert_with_log!(
        !cause.is_interrupted_only(),
        "interrupt & fail",
        false,
        cause.is_interrupted_only()
    );
    assert!(cause.is_interrupted());
    assert!(Cause::<&str>::interrupt(id).is_interrupted_only());
    assert!(!Cause::<&str>::empty().is_interrupted_only());
    test_complete!("mixed_cause_is_not_interrupted_only");
}

#[test]
fn sequential_and_parallel_are_distinct() {
    init_test_logging();
    let a = Cause::fail(1);
    let b = Cause::fail(2);
    assert_ne!(a.clone().then(b.clone()), a.clone().both(b.clone()));
    assert_ne!(a.clone().then(b.clone()), b.then(a));
}
