//! Structured concurrency and supervisor hooks: children die with their
//! parent, daemons do not, closed scopes reject children and supervisors
//! observe every lifecycle event.

#[macro_use]
mod common;

use common::*;
use fibra::effect::InstrKind;
use fibra::types::AnyExit;
use fibra::{
    Effect, Exit, FiberId, FiberRefs, ForkScope, RuntimeBuilder, RuntimeConfig, RuntimeFiber,
    Supervisor, Track,
};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn set(flag: &Arc<AtomicBool>) -> Effect<()> {
    let flag = Arc::clone(flag);
    Effect::succeed_with(move || flag.store(true, Ordering::SeqCst))
}

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<String>>,
    effects: AtomicUsize,
}

impl Recording {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Supervisor for Recording {
    fn on_start(&self, _refs: &FiberRefs, parent: Option<FiberId>, fiber: &RuntimeFiber) {
        let kind = if parent.is_some() { "child" } else { "root" };
        self.events
            .lock()
            .push(format!("start {kind} {}", fiber.id().as_u64()));
    }

    fn on_end(&self, exit: &AnyExit, fiber: &RuntimeFiber) {
        self.events.lock().push(format!(
            "end {} {}",
            fiber.id().as_u64(),
            if exit.is_success() { "ok" } else { "failed" }
        ));
    }

    fn on_suspend(&self, _fiber: FiberId) {
        self.events.lock().push("suspend".to_string());
    }

    fn on_effect(&self, _fiber: FiberId, _kind: InstrKind) {
        self.effects.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Structured concurrency
// ============================================================================

#[test]
fn finishing_parent_interrupts_its_children() {
    init_test_logging();
    test_phase!("finishing_parent_interrupts_its_children");
    let interrupted = Arc::new(AtomicBool::new(false));
    let child = Effect::<(), Infallible>::never().on_interrupt(set(&interrupted));
    let program = child.fork::<Infallible>().map(|fiber| fiber.id());
    let exit = run(program);
    assert!(exit.is_success(), "parent exit: {exit:?}");
    assert!(
        interrupted.load(Ordering::SeqCst),
        "child is interrupted before the parent reports its exit"
    );
    test_complete!("finishing_parent_interrupts_its_children");
}

#[test]
fn daemon_outlives_its_parent() {
    init_test_logging();
    let runtime = test_runtime_with_workers(2);
    let finished = Arc::new(AtomicBool::new(false));
    let daemon = Effect::<(), Infallible>::sleep(Duration::from_millis(20)).zip_right(set(&finished));
    let exit = runtime.run_blocking(daemon.fork_daemon::<Infallible>().map(|fiber| fiber.id()));
    assert!(exit.is_success());
    assert!(!finished.load(Ordering::SeqCst));
    assert!(wait_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst)));
}

#[test]
fn children_of_interrupted_parent_are_interrupted() {
    init_test_logging();
    let grandchild_cleaned = Arc::new(AtomicBool::new(false));
    let grandchild = Effect::<(), Infallible>::never().on_interrupt(set(&grandchild_cleaned));
    let parent = grandchild
        .fork::<Infallible>()
        .zip_right(Effect::<(), Infallible>::never());
    let program = parent
        .fork::<Infallible>()
        .flat_map(|fiber| fiber.interrupt::<Infallible>());
    match run(program) {
        Exit::Success(exit) => assert!(exit.is_interrupted_only(), "parent exit: {exit:?}"),
        Exit::Failure(cause) => unreachable!("interrupt never fails: {cause}"),
    }
    assert!(grandchild_cleaned.load(Ordering::SeqCst));
}

struct ClosedScope;

impl ForkScope for ClosedScope {
    fn fiber_id(&self) -> FiberId {
        FiberId::new_for_test(99)
    }

    fn add(&self, _config: &RuntimeConfig, _child: &RuntimeFiber) -> bool {
        false
    }
}

#[test]
fn closed_scope_interrupts_new_children() {
    init_test_logging();
    test_phase!("closed_scope_interrupts_new_children");
    let ran = Arc::new(AtomicBool::new(false));
    let work = set(&ran);
    let program = work
        .fork_in::<Infallible>(Arc::new(ClosedScope))
        .flat_map(|fiber| fiber.await_exit::<Infallible>());
    match run(program) {
        Exit::Success(exit) => {
            assert_eq!(exit, Exit::interrupt(FiberId::new_for_test(99)));
        }
        Exit::Failure(cause) => unreachable!("await never fails: {cause}"),
    }
    assert!(!ran.load(Ordering::SeqCst), "a rejected child never starts");
    test_complete!("closed_scope_interrupts_new_children");
}

#[test]
fn with_fork_scope_redirects_children() {
    init_test_logging();
    let program = Effect::<(), Infallible>::never()
        .fork::<Infallible>()
        .with_fork_scope(Arc::new(ClosedScope))
        .flat_map(|fiber| fiber.await_exit::<Infallible>());
    match run(program) {
        Exit::Success(exit) => assert!(exit.is_interrupted_only()),
        Exit::Failure(cause) => unreachable!("await never fails: {cause}"),
    }
}

// ============================================================================
// Supervisors
// ============================================================================

#[test]
fn runtime_supervisor_sees_roots_and_children() {
    init_test_logging();
    test_phase!("runtime_supervisor_sees_roots_and_children");
    let recording = Arc::new(Recording::default());
    let runtime = RuntimeBuilder::current_thread()
        .supervisor(recording.clone())
        .build()
        .expect("runtime");

    let program = Effect::<i32, ()>::succeed(1)
        .delay(Duration::from_millis(1))
        .fork::<()>()
        .flat_map(|fiber| fiber.join());
    assert_eq!(runtime.run_blocking(program), Exit::Success(1));

    let events = recording.events();
    let starts = events.iter().filter(|e| e.starts_with("start")).count();
    let ends = events.iter().filter(|e| e.starts_with("end")).count();
    assert_with_log!(starts == 2, "starts", 2, starts);
    assert_with_log!(ends == 2, "ends", 2, ends);
    assert!(events.iter().any(|e| e.starts_with("start root")));
    assert!(events.iter().any(|e| e.starts_with("start child")));
    assert!(events.iter().any(|e| e == "suspend"));
    assert!(recording.effects.load(Ordering::SeqCst) > 0);
    test_complete!("runtime_supervisor_sees_roots_and_children");
}

#[test]
fn end_event_reports_failure() {
    init_test_logging();
    let recording = Arc::new(Recording::default());
    let program = Effect::<(), &str>::fail("boom")
        .fork::<&str>()
        .flat_map(|fiber| fiber.await_exit::<&str>())
        .supervised(recording.clone());
    let exit = run(program);
    assert!(matches!(exit, Exit::Success(Exit::Failure(_))));
    assert!(recording.events().iter().any(|e| e.ends_with("failed")));
}

#[test]
fn track_lists_live_children() {
    init_test_logging();
    let track = Arc::new(Track::new());
    let seen = Arc::new(AtomicUsize::new(0));
    let (observer, count) = (track.clone(), seen.clone());
    let program = Effect::<(), Infallible>::never()
        .fork::<Infallible>()
        .zip(Effect::<(), Infallible>::never().fork())
        .flat_map(move |(a, b)| {
            Effect::succeed_with(move || count.store(observer.len(), Ordering::SeqCst))
                .zip_right(a.interrupt())
                .zip_right(b.interrupt())
        })
        .supervised(track.clone());
    assert!(run(program).is_success());
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(track.is_empty());
}
