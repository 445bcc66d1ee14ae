//! Control-flow escapes out of user code.
//!
//! Code running inside a fiber (a thunk or a continuation) can abandon the
//! current step by unwinding with one of these signals. The interpreter
//! catches them around every step. They use `resume_unwind`, so no panic
//! hook runs and nothing is printed.

use crate::types::{AnyExit, Exit, Value};
use std::panic;

/// Payload carried by a control-flow unwind.
pub(crate) enum FiberSignal {
    /// Interrupt the current fiber.
    Interrupt,
    /// Resume the continuation stack with this exit.
    EarlyExit(AnyExit),
}

/// Interrupts the fiber running the calling code.
///
/// Only meaningful inside a fiber; elsewhere it is an ordinary unwind.
pub fn interrupt_current() -> ! {
    panic::resume_unwind(Box::new(FiberSignal::Interrupt))
}

/// Abandons the current step and continues the fiber with `exit`, as if the
/// current instruction had produced it.
pub fn exit_early<A: Value, E: Value>(exit: Exit<A, E>) -> ! {
    panic::resume_unwind(Box::new(FiberSignal::EarlyExit(exit.erase())))
}
