//! Strata VM execution core
//!
//! This crate interprets compiled [`strata_bytecode::Unit`]s for a dynamically
//! typed, reference-counted, class-based guest language. It provides:
//! - A chunked evaluation stack with activation records ([`stack`])
//! - Method, constructor and class-constant resolution
//! - The invocation protocol and the bytecode dispatch loop
//! - Nested re-entry from native code back into the interpreter
//! - Suspension and resumption of generator and async frames ([`resumable`])
//! - The error/exception state machine with user handler stacks
//!
//! Everything is reached through an explicit, request-scoped
//! [`ExecutionContext`]; there is no global interpreter state.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod func;
pub mod interpreter;
pub mod object;
pub mod output;
pub mod resumable;
pub mod stack;
pub mod value;

pub use func::{Callee, Func, FuncId, NativeFn, NativeFunc, UnitId, UnitInfo};
pub use interpreter::{
    severity, surprise_bits, BlockExit, CallCtx, CallType, CodeCache, ErrorState, ErrorThrowMode,
    ExcessArgsPolicy, ExecutionContext, ExecutionStats, FrameInfo, InterpretOnly, InvokeFlags,
    LastError, LookupResult, MethodSource, OpcodeResult, RequestOutcome, ResourceLimits,
    StackArgsState, SurpriseFlags, VmOptions, VmState, ERROR_EXCEPTION_CLASS, EXCEPTION_CLASS,
    GENERATOR_CLASS, WAIT_HANDLE_CLASS,
};
pub use object::{Class, ClassId, MethodEntry, ObjectData, ObjectRef};
pub use output::{OutputSink, SharedBuffer, StdoutSink};
pub use resumable::{Resumable, ResumableKind, ResumableState, WaitHandleState};
pub use stack::{ActRec, CallSubject, FrameId, Stack, VarEnv};
pub use value::{Array, ArrayKey, ArrayRef, Value};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Stack overflow
    #[error("Stack overflow")]
    StackOverflow,

    /// Stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// The stack cursor left the bounds of the current frame
    #[error("Stack corruption: {0}")]
    StackCorruption(String),

    /// Invalid opcode
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Type error
    #[error("Type error: {0}")]
    TypeError(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Class lookup failed
    #[error("Class '{0}' not found")]
    ClassNotFound(String),

    /// Function lookup failed
    #[error("Call to undefined function {0}()")]
    FunctionNotFound(String),

    /// Method lookup failed with no magic fallback
    #[error("Call to undefined method {class}::{method}()")]
    MethodNotFound {
        /// Class searched
        class: String,
        /// Method name
        method: String,
    },

    /// Class constant lookup failed
    #[error("Undefined class constant {class}::{constant}")]
    ConstantNotFound {
        /// Class searched
        class: String,
        /// Constant name
        constant: String,
    },

    /// A required parameter received no argument
    #[error("Too few arguments to function {function}(): {passed} passed and at least {required} expected")]
    TooFewArguments {
        /// Callee name
        function: String,
        /// Arguments supplied
        passed: usize,
        /// Required parameters
        required: usize,
    },

    /// Surplus arguments rejected by [`ExcessArgsPolicy::Error`]
    #[error("Too many arguments to function {function}(): {passed} passed and at most {declared} expected")]
    TooManyArguments {
        /// Callee name
        function: String,
        /// Arguments supplied
        passed: usize,
        /// Declared parameters
        declared: usize,
    },

    /// A resumable was resumed while running or after completion
    #[error("Invalid resumption: {0}")]
    InvalidResume(String),

    /// A guest exception propagating out of the interpreter
    #[error("Uncaught exception: {0}")]
    Exception(Value),

    /// Guest code requested request termination
    #[error("Exit with status {0}")]
    Exit(i64),

    /// Execution deadline passed
    #[error("Maximum execution time exceeded")]
    Timeout,

    /// The request already hit a fatal error
    #[error("Request has been terminated")]
    RequestTerminated,

    /// Unit failed bytecode verification
    #[error("Verification failed: {0}")]
    Verify(#[from] strata_bytecode::VerifyError),

    /// Unrecoverable error raised by the error state machine
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl VmError {
    /// Fatal errors bypass guest handlers and terminate the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::StackOverflow
                | VmError::StackUnderflow
                | VmError::StackCorruption(_)
                | VmError::InvalidOpcode(_)
                | VmError::ClassNotFound(_)
                | VmError::MethodNotFound { .. }
                | VmError::ConstantNotFound { .. }
                | VmError::TooFewArguments { .. }
                | VmError::InvalidResume(_)
                | VmError::Timeout
                | VmError::RequestTerminated
                | VmError::Verify(_)
                | VmError::Fatal(_)
        )
    }

    /// The thrown guest value, if this is a guest exception
    pub fn exception(&self) -> Option<&Value> {
        match self {
            VmError::Exception(v) => Some(v),
            _ => None,
        }
    }
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
