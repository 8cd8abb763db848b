//! Result types shared by the dispatch loop and opcode handlers

use crate::value::Value;
use crate::VmError;

/// Result of executing a single opcode
///
/// Used internally by the dispatch loop to determine control flow.
#[derive(Debug)]
pub enum OpcodeResult {
    /// Continue with the next instruction in the same frame
    Continue,

    /// The current frame changed (call or return); reload it
    FrameChanged,

    /// The session's entry frame finished; leave the dispatch loop
    Return(Value),

    /// Throw a guest exception at the current instruction
    Throw(Value),

    /// An error occurred
    Error(VmError),
}

/// Outcome of one [`dispatch_bb`](crate::ExecutionContext::dispatch_bb) step
#[derive(Debug)]
pub enum BlockExit {
    /// Stopped after a control-flow instruction; the session is still live
    Continue,
    /// The session's entry frame returned
    Returned(Value),
}

/// Dispatch loop mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    /// Run until the entry frame exits
    Continuous,
    /// Return after any branch, call, return or suspension
    BasicBlock,
}

/// Outcome of unwinding a thrown value
#[derive(Debug)]
pub(crate) enum Unwound {
    /// A handler was found or a frame returned normally; keep dispatching
    Resume,
    /// The entry frame finished without rethrowing
    Returned(Value),
}

/// How a suspended frame is re-entered
#[derive(Debug)]
pub(crate) enum ResumeInput {
    /// First run of a created generator
    Start,
    /// The suspension opcode evaluates to this value
    Value(Value),
    /// The suspension opcode throws this value
    Throw(Value),
}
