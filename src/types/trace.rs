//! Execution traces.
//!
//! A trace is the list of source locations a fiber passed through most
//! recently (newest first), recorded at `map`/`flat_map`/`fork` call sites.
//! Failures pick up the trace of the fiber that raised them.

use super::id::FiberId;
use core::fmt;
use std::collections::VecDeque;
use std::panic::Location;

/// A snapshot of the recent execution of one fiber.
#[derive(Clone, PartialEq, Eq)]
pub struct Trace {
    /// The fiber the trace was captured on.
    pub fiber_id: FiberId,
    /// Recorded call sites, newest first.
    pub execution: Vec<&'static Location<'static>>,
}

impl Trace {
    /// Creates a trace from recorded locations (newest first).
    #[must_use]
    pub fn new(fiber_id: FiberId, execution: Vec<&'static Location<'static>>) -> Self {
        Self {
            fiber_id,
            execution,
        }
    }

    /// Returns the most recent location, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&'static Location<'static>> {
        self.execution.first().copied()
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("fiber_id", &self.fiber_id)
            .field("depth", &self.execution.len())
            .finish()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fiber {} execution trace:", self.fiber_id)?;
        for loc in &self.execution {
            writeln!(f, "  at {}:{}:{}", loc.file(), loc.line(), loc.column())?;
        }
        Ok(())
    }
}

/// Bounded ring of recent locations owned by a running fiber.
#[derive(Debug, Default)]
pub(crate) struct TraceRing {
    capacity: usize,
    entries: VecDeque<&'static Location<'static>>,
}

impl TraceRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub(crate) fn record(&mut self, location: &'static Location<'static>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(location);
    }

    pub(crate) fn snapshot(&self, fiber_id: FiberId) -> Option<Trace> {
        if self.capacity == 0 {
            return None;
        }
        Some(Trace::new(fiber_id, self.entries.iter().copied().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn ring_keeps_newest_first() {
        let mut ring = TraceRing::new(2);
        let a = here();
        let b = here();
        let c = here();
        ring.record(a);
        ring.record(b);
        ring.record(c);
        let trace = ring.snapshot(FiberId::new_for_test(3)).expect("enabled");
        assert_eq!(trace.execution.len(), 2);
        assert_eq!(trace.latest(), Some(c));
        assert_eq!(trace.execution[1], b);
    }

    #[test]
    fn zero_capacity_disables() {
        let mut ring = TraceRing::new(0);
        ring.record(here());
        assert!(ring.snapshot(FiberId::NONE).is_none());
    }
}
