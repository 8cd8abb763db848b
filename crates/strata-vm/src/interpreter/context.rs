//! Execution context: the explicit, request-scoped interpreter handle
//!
//! Each `ExecutionContext` represents one request with:
//! - Its own evaluation stack, frame arena and register set
//! - Loaded units, classes and native functions
//! - The nested VM-state stack for re-entry
//! - Error handling state and user handler stacks
//! - Resource limits and surprise flags

use super::class_registry::ClassRegistry;
use super::errors::ErrorHandling;
use super::native_registry::NativeRegistry;
use super::surprise::SurpriseFlags;
use super::unit_store::UnitStore;
use super::vm_state::VmState;
use crate::func::Func;
use crate::output::{OutputSink, StdoutSink};
use crate::stack::{FrameId, Stack, VarEnv, DEFAULT_MAX_STACK_SLOTS};
use crate::value::Value;
use crate::{VmError, VmResult};
use serde::Deserialize;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Resource limits for a request
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum evaluation stack size in slots
    pub max_stack_slots: usize,

    /// Maximum number of nested VM sessions
    pub max_nesting_depth: usize,

    /// Wall-clock budget in milliseconds (0 = unlimited)
    pub max_execution_time_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_stack_slots: DEFAULT_MAX_STACK_SLOTS,
            max_nesting_depth: 256,
            max_execution_time_ms: 0,
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with a wall-clock budget
    pub fn with_time_limit(max_execution_time_ms: u64) -> Self {
        Self {
            max_execution_time_ms,
            ..Default::default()
        }
    }
}

/// What to do with surplus arguments when the callee has neither a variadic
/// parameter nor the extra-args attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ExcessArgsPolicy {
    /// Discard silently
    Drop,
    /// Discard after raising `E_WARNING`
    #[default]
    WarnAndDrop,
    /// Fail the call with [`VmError::TooManyArguments`]
    Error,
}

/// Options for creating an `ExecutionContext`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Resource limits
    pub limits: ResourceLimits,

    /// Surplus argument handling
    pub excess_args: ExcessArgsPolicy,

    /// Severities that are reported (`error_reporting`)
    pub error_reporting: u32,

    /// Log unhandled reported errors through `tracing`
    pub log_errors: bool,

    /// Convert every unhandled error into a thrown exception
    pub throw_all_errors: bool,

    /// Redirect target shown after a fatal error
    pub error_page: Option<String>,

    /// Surprise checks between wall-clock deadline reads
    pub surprise_poll_interval: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            excess_args: ExcessArgsPolicy::default(),
            error_reporting: super::severity::E_ALL,
            log_errors: true,
            throw_all_errors: false,
            error_page: None,
            surprise_poll_interval: 1024,
        }
    }
}

impl VmOptions {
    /// Parse options from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `VmError::RuntimeError` on malformed input.
    pub fn from_json(json: &str) -> VmResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| VmError::RuntimeError(format!("invalid VM options: {}", e)))
    }
}

/// How a request ended
#[derive(Debug)]
pub enum RequestOutcome {
    /// The pseudo-main returned
    Completed(Value),
    /// Guest code called `exit`
    Exited(i64),
    /// An uncaught exception was claimed by a user exception handler
    ExceptionHandled,
    /// The request was terminated by a fatal error
    Fatal(String),
}

/// Execution counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Opcodes dispatched
    pub opcodes: u64,
    /// Guest frames entered
    pub calls: u64,
    /// Native functions called
    pub native_calls: u64,
    /// Nested sessions started
    pub reentries: u64,
    /// Deepest nesting reached
    pub max_nesting: usize,
    /// Frames detached into resumables
    pub suspensions: u64,
    /// Resumables re-attached
    pub resumptions: u64,
    /// Surprise checks performed
    pub surprise_checks: u64,
    /// Entries into functions the code cache reported invalidated
    pub invalidated_entries: u64,
}

/// Invalidation signal from the native code generator
pub trait CodeCache {
    /// Whether compiled code for `func` must not be entered
    fn is_invalidated(&self, func: &Func) -> bool;
}

/// Code cache for interpreter-only execution
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpretOnly;

impl CodeCache for InterpretOnly {
    fn is_invalidated(&self, _func: &Func) -> bool {
        false
    }
}

/// Interpreter registers
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Registers {
    /// Next instruction offset in the current frame
    pub pc: usize,
    /// Current frame
    pub fp: Option<FrameId>,
    /// Entry frame of the current nested session
    pub first_ar: Option<FrameId>,
}

/// Request-scoped interpreter state
pub struct ExecutionContext {
    pub(crate) options: VmOptions,
    pub(crate) units: UnitStore,
    pub(crate) classes: ClassRegistry,
    pub(crate) natives: NativeRegistry,
    pub(crate) stack: Stack,
    pub(crate) regs: Registers,
    pub(crate) nested: SmallVec<[VmState; 32]>,
    pub(crate) nesting: usize,
    pub(crate) errors: ErrorHandling,
    pub(crate) surprise: Arc<SurpriseFlags>,
    pub(crate) surprise_polls: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) output: Box<dyn OutputSink>,
    pub(crate) globals: VarEnv,
    pub(crate) stats: ExecutionStats,
    pub(crate) terminated: bool,
    pub(crate) code_cache: Rc<dyn CodeCache>,
    pub(crate) interrupt_hook: Option<Rc<dyn Fn(&ExecutionContext)>>,
    pub(crate) exit_callback: Option<Value>,
}

impl ExecutionContext {
    /// Initialize a request writing to standard output
    pub fn new(options: VmOptions) -> Self {
        Self::with_output(options, Box::new(StdoutSink))
    }

    /// Initialize a request with an output sink
    pub fn with_output(options: VmOptions, output: Box<dyn OutputSink>) -> Self {
        let deadline = match options.limits.max_execution_time_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };
        let mut ctx = Self {
            stack: Stack::with_max_slots(options.limits.max_stack_slots),
            errors: ErrorHandling::new(&options),
            options,
            units: UnitStore::new(),
            classes: ClassRegistry::new(),
            natives: NativeRegistry::new(),
            regs: Registers::default(),
            nested: SmallVec::new(),
            nesting: 0,
            surprise: Arc::new(SurpriseFlags::new()),
            surprise_polls: 0,
            deadline,
            output,
            globals: Rc::new(RefCell::new(Default::default())),
            stats: ExecutionStats::default(),
            terminated: false,
            code_cache: Rc::new(InterpretOnly),
            interrupt_hook: None,
            exit_callback: None,
        };
        ctx.register_builtins();
        ctx
    }

    /// Request options
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Execution counters
    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    /// Evaluation stack (read-only)
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Next instruction offset in the current frame
    pub fn pc(&self) -> usize {
        self.regs.pc
    }

    /// Current frame
    pub fn fp(&self) -> Option<FrameId> {
        self.regs.fp
    }

    /// Entry frame of the current nested session
    pub fn first_ar(&self) -> Option<FrameId> {
        self.regs.first_ar
    }

    /// The request's global variable environment
    pub fn globals(&self) -> &VarEnv {
        &self.globals
    }

    /// Handle for raising surprise conditions from other threads
    pub fn surprise_flags(&self) -> Arc<SurpriseFlags> {
        Arc::clone(&self.surprise)
    }

    /// Install the debugger interrupt hook
    pub fn set_interrupt_hook(&mut self, hook: Rc<dyn Fn(&ExecutionContext)>) {
        self.interrupt_hook = Some(hook);
    }

    /// Install a callable to run once when the request exits
    ///
    /// Returns the previously installed callback.
    pub fn set_exit_callback(&mut self, callback: Value) -> Option<Value> {
        self.exit_callback.replace(callback)
    }

    /// Install a code cache invalidation source
    pub fn set_code_cache(&mut self, cache: Rc<dyn CodeCache>) {
        self.code_cache = cache;
    }

    /// Replace the output sink
    pub fn set_output(&mut self, output: Box<dyn OutputSink>) {
        self.output = output;
    }

    /// Write to the output sink
    pub fn write(&mut self, bytes: &[u8]) {
        self.output.write(bytes);
    }

    /// Whether a fatal error ended the request
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Run a unit's pseudo-main as the request's top level
    ///
    /// Uncaught exceptions are offered to the user exception handlers, and
    /// anything else that escapes goes down the fatal-error path.
    pub fn run_request(&mut self, unit: crate::func::UnitId) -> RequestOutcome {
        match self.invoke_unit(unit) {
            Ok(value) => RequestOutcome::Completed(value),
            Err(VmError::Exit(status)) => RequestOutcome::Exited(status),
            Err(VmError::Exception(exc)) => match self.on_unhandled_exception(&exc) {
                Ok(true) => RequestOutcome::ExceptionHandled,
                Ok(false) => {
                    let err = VmError::Fatal(format!("Uncaught {}", exc));
                    self.on_fatal_error(&err);
                    RequestOutcome::Fatal(err.to_string())
                }
                Err(VmError::Exit(status)) => RequestOutcome::Exited(status),
                Err(err) => {
                    self.on_fatal_error(&err);
                    RequestOutcome::Fatal(err.to_string())
                }
            },
            Err(err) => {
                self.on_fatal_error(&err);
                RequestOutcome::Fatal(err.to_string())
            }
        }
    }

    /// Tear down per-request state
    ///
    /// Clears frames, nested sessions, handler stacks and error state. Loaded
    /// units and classes stay. The exit callback runs after the frames are
    /// gone and before the globals are cleared.
    pub fn request_exit(&mut self) {
        self.reset_execution_state();
        if let Some(callback) = self.exit_callback.take() {
            if let Err(err) = self.call_user_func(&callback, &[]) {
                warn!(target: "strata::vm", error = %err, "exit callback failed");
            }
            self.reset_execution_state();
        }
        self.errors.reset(&self.options);
        self.globals.borrow_mut().clear();
    }

    /// Drop all frames and stack contents
    pub(crate) fn reset_execution_state(&mut self) {
        self.stack.truncate_frames(0);
        self.stack.set_floor(0);
        self.stack.truncate(0);
        self.regs = Registers::default();
        self.nested.clear();
        self.nesting = 0;
    }
}
