//! Request-scoped interpreter: resolution, invocation, dispatch, re-entry,
//! suspension and the error state machine
//!
//! Every operation is a method on [`ExecutionContext`]; the submodules split
//! its `impl` blocks by concern.

mod builtins;
mod class_registry;
mod context;
mod dispatch;
mod errors;
mod execution;
mod frame_vars;
mod invoke;
mod lookup;
mod native_registry;
pub mod opcodes;
mod suspend;
mod surprise;
mod unit_store;
mod vm_state;

pub use builtins::{
    ERROR_EXCEPTION_CLASS, EXCEPTION_CLASS, GENERATOR_CLASS, WAIT_HANDLE_CLASS,
};
pub use context::{
    CodeCache, ExcessArgsPolicy, ExecutionContext, ExecutionStats, InterpretOnly,
    RequestOutcome, ResourceLimits, VmOptions,
};
pub use errors::{severity, ErrorState, ErrorThrowMode, LastError};
pub use execution::{BlockExit, OpcodeResult};
pub use invoke::{CallCtx, InvokeFlags, StackArgsState};
pub use lookup::{CallType, LookupResult, MethodSource};
pub use surprise::{surprise_bits, SurpriseFlags};
pub use vm_state::{FrameInfo, VmState};
