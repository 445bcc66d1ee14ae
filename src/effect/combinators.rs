//! Concurrent combinators built on [`Instr::RaceWith`] and forking.
//!
//! Every combinator here forks its operands as children of the calling
//! fiber and guarantees that no child is still running when the combined
//! effect completes: the loser of a race is interrupted and awaited, and a
//! failed side of a parallel zip interrupts and awaits the other side.

use super::instr::{Instr, Link, RaceWith};
use super::Effect;
use crate::fiber::handle::Fiber;
use crate::types::{Cause, Exit, FiberId, Value};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

impl<A: Value, E: Value> Effect<A, E> {
    /// Runs both effects concurrently and hands the first exit, with the
    /// other side's fiber, to the matching continuation.
    ///
    /// Both sides run interruptibly. If the calling fiber is interrupted
    /// while waiting, both sides are interrupted before it continues.
    #[track_caller]
    pub fn race_with<B, E2, C, E3>(
        self,
        that: Effect<B, E2>,
        left_done: impl FnOnce(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + 'static,
        right_done: impl FnOnce(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + 'static,
    ) -> Effect<C, E3>
    where
        B: Value,
        E2: Value,
        C: Value,
        E3: Value,
    {
        Effect::from_instr(Instr::RaceWith(Box::new(RaceWith {
            left: Link::new(self.instr),
            right: Link::new(that.instr),
            left_wins: Box::new(move |exit, loser| {
                left_done(Exit::from_erased(exit), Fiber::from_runtime(loser)).instr
            }),
            right_wins: Box::new(move |exit, loser| {
                right_done(Exit::from_erased(exit), Fiber::from_runtime(loser)).instr
            }),
            scope: None,
            location: Location::caller(),
        })))
    }

    /// Returns the first success. When the first side to finish failed, the
    /// result is the other side's outcome, with both causes combined if it
    /// fails too. The losing side is interrupted and awaited.
    #[track_caller]
    pub fn race(self, that: Self) -> Self {
        self.race_with(that, arbitrate_race, arbitrate_race)
    }

    /// Returns whichever side finishes first, successful or not.
    #[track_caller]
    pub fn race_first(self, that: Self) -> Self {
        self.exit::<E>()
            .race(that.exit())
            .flat_map(Effect::done)
    }

    /// Runs both effects concurrently and pairs their values.
    #[track_caller]
    pub fn zip_par<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with_par(that, |a, b| (a, b))
    }

    /// Runs both effects concurrently and combines their values.
    ///
    /// If either side fails, the other is interrupted and the result fails
    /// with both causes in parallel, left side first.
    #[track_caller]
    pub fn zip_with_par<B: Value, C: Value>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E> {
        let combine = Arc::new(Mutex::new(Some(f)));
        let left_combine = Arc::clone(&combine);
        self.race_with(
            that,
            move |exit: Exit<A, E>, loser: Fiber<B, E>| match exit {
                Exit::Success(a) => loser
                    .join()
                    .flat_map(move |b| apply_once(&left_combine, a, b)),
                Exit::Failure(cause) => interrupt_loser(loser, cause, true),
            },
            move |exit: Exit<B, E>, loser: Fiber<A, E>| match exit {
                Exit::Success(b) => loser
                    .join()
                    .flat_map(move |a| apply_once(&combine, a, b)),
                Exit::Failure(cause) => interrupt_loser(loser, cause, false),
            },
        )
    }

    /// Succeeds with `Some` if this effect finishes within `duration`, or
    /// `None` after interrupting it.
    #[track_caller]
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race_first(Effect::<(), E>::sleep(duration).interruptible().map(|()| None))
    }

    /// Runs this effect on a background fiber so that interrupting the
    /// caller returns immediately. The background fiber is interrupted
    /// without waiting for it to finish.
    pub fn disconnect(self) -> Self {
        Effect::uninterruptible_mask(move |restore| {
            Effect::<FiberId, E>::fiber_id().flat_map(move |id| {
                restore
                    .restore(self)
                    .fork_daemon()
                    .flat_map(move |fiber: Fiber<A, E>| {
                        let background = fiber.clone();
                        restore.restore(fiber.join()).on_interrupt(
                            background
                                .interrupt_as::<Infallible>(id)
                                .fork_daemon::<Infallible>()
                                .as_unit(),
                        )
                    })
            })
        })
    }
}

/// Race continuation: keeps a winning success, or falls back on the loser.
fn arbitrate_race<A: Value, E: Value>(winner: Exit<A, E>, loser: Fiber<A, E>) -> Effect<A, E> {
    match winner {
        Exit::Success(value) => loser.interrupt().map(move |_| value),
        Exit::Failure(cause) => loser
            .join()
            .map_error_cause(move |loser_cause| cause.both(loser_cause)),
    }
}

/// Applies the parallel-zip combiner. Only one race continuation ever runs,
/// so the slot is always full.
fn apply_once<A: Value, B: Value, C: Value, E: Value>(
    slot: &Mutex<Option<impl FnOnce(A, B) -> C>>,
    a: A,
    b: B,
) -> Effect<C, E> {
    match slot.lock().take() {
        Some(f) => Effect::succeed(f(a, b)),
        None => Effect::die("parallel zip combiner already used"),
    }
}

/// Interrupts the other side of a failed parallel zip and fails with both
/// causes, keeping left-to-right order.
fn interrupt_loser<X: Value, C: Value, E: Value>(
    loser: Fiber<X, E>,
    cause: Cause<E>,
    winner_is_left: bool,
) -> Effect<C, E> {
    loser.interrupt().flat_map(move |exit| match exit {
        Exit::Success(_) => Effect::fail_cause(cause),
        Exit::Failure(loser_cause) if winner_is_left => Effect::fail_cause(cause.both(loser_cause)),
        Exit::Failure(loser_cause) => Effect::fail_cause(loser_cause.both(cause)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, run};

    // =========================================================================
    // Race
    // =========================================================================

    #[test]
    fn race_prefers_faster_success() {
        init_test_logging();
        crate::test_phase!("race_prefers_faster_success");
        let slow = Effect::<i32, &str>::succeed(1).delay(Duration::from_millis(200));
        let fast = Effect::<i32, &str>::succeed(2).delay(Duration::from_millis(5));
        assert_eq!(run(slow.race(fast)), Exit::Success(2));
        crate::test_complete!("race_prefers_faster_success");
    }

    #[test]
    fn race_falls_back_on_loser_when_winner_fails() {
        init_test_logging();
        let failing = Effect::<i32, &str>::fail("nope");
        let slow = Effect::<i32, &str>::succeed(7).delay(Duration::from_millis(10));
        assert_eq!(run(failing.race(slow)), Exit::Success(7));
    }

    #[test]
    fn race_with_never_returns_the_other_side() {
        init_test_logging();
        let program = Effect::<i32, ()>::never().race(Effect::succeed(3));
        assert_eq!(run(program), Exit::Success(3));
    }

    #[test]
    fn race_both_failing_combines_causes() {
        init_test_logging();
        let left = Effect::<i32, &str>::fail("left");
        let right = Effect::<i32, &str>::fail("right").delay(Duration::from_millis(20));
        assert_eq!(
            run(left.race(right)),
            Exit::Failure(Cause::fail("left").both(Cause::fail("right")))
        );
    }

    #[test]
    fn race_first_keeps_first_failure() {
        init_test_logging();
        let failing = Effect::<i32, &str>::fail("first");
        let slow = Effect::<i32, &str>::succeed(1).delay(Duration::from_millis(50));
        assert_eq!(run(failing.race_first(slow)), Exit::fail("first"));
    }

    #[test]
    fn race_loser_finalizer_runs_before_result() {
        init_test_logging();
        let log = Arc::new(Mutex::new(Vec::new()));
        let cleanup = Arc::clone(&log);
        let loser = Effect::<i32, ()>::never().ensuring(Effect::succeed_with(move || {
            cleanup.lock().push("loser cleaned up");
        }));
        let exit = run(loser.race(Effect::succeed(1)));
        assert_eq!(exit, Exit::Success(1));
        assert_eq!(*log.lock(), vec!["loser cleaned up"]);
    }

    // =========================================================================
    // Parallel zip
    // =========================================================================

    #[test]
    fn zip_par_pairs_in_argument_order() {
        init_test_logging();
        let left = Effect::<i32, ()>::succeed(1).delay(Duration::from_millis(15));
        let right = Effect::<&str, ()>::succeed("b");
        assert_eq!(run(left.zip_par(right)), Exit::Success((1, "b")));
    }

    #[test]
    fn zip_par_failure_interrupts_other_side() {
        init_test_logging();
        crate::test_phase!("zip_par_failure_interrupts_other_side");
        let interrupted = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&interrupted);
        let slow = Effect::<i32, &str>::never().on_interrupt(Effect::succeed_with(move || {
            *flag.lock() = true;
        }));
        let exit = run(slow.zip_par(Effect::<i32, &str>::fail("bad")));
        match exit {
            Exit::Failure(cause) => {
                assert_eq!(cause.failures(), vec!["bad"]);
                assert!(cause.is_interrupted());
            }
            other => unreachable!("expected failure, got {other:?}"),
        }
        assert!(*interrupted.lock());
        crate::test_complete!("zip_par_failure_interrupts_other_side");
    }

    // =========================================================================
    // Timeout and disconnect
    // =========================================================================

    #[test]
    fn timeout_expires_on_slow_effect() {
        init_test_logging();
        let program = Effect::<i32, ()>::never().timeout(Duration::from_millis(10));
        assert_eq!(run(program), Exit::Success(None));
    }

    #[test]
    fn timeout_keeps_fast_value() {
        init_test_logging();
        let program = Effect::<i32, ()>::succeed(4).timeout(Duration::from_secs(5));
        assert_eq!(run(program), Exit::Success(Some(4)));
    }

    #[test]
    fn disconnect_returns_value() {
        init_test_logging();
        let program = Effect::<i32, ()>::succeed(11).disconnect();
        assert_eq!(run(program), Exit::Success(11));
    }
}
