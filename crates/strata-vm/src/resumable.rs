//! Suspendable frames for generators and async functions
//!
//! A [`Resumable`] is a detached activation: the locals, iterator cursors and
//! live operand-stack slice of a frame, plus the pc to continue at. It is
//! shared (`Rc<RefCell<_>>`) between the guest-visible owner object (a
//! `Generator` or `WaitHandle`) and, while it runs, the frame re-attached to
//! it. Dropping the owner without resuming releases everything it holds.
//!
//! # State machine
//!
//! ```text
//! Created ──► Running ──► Suspended ──► Running ──► … ──► Completed
//!                └──────────────────────────────────────────┘
//! ```
//!
//! No transition leaves `Completed`; resuming a `Running` or `Completed`
//! resumable is reported as [`VmError::InvalidResume`].

use crate::func::Func;
use crate::object::ObjectRef;
use crate::stack::{ActRec, CallSubject, IterState};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Which owner drives the resumable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumableKind {
    /// Driven by an iteration consumer, produces key/value pairs
    Generator,
    /// Driven by an external scheduler, suspends on await targets
    Async,
}

/// Lifecycle of a resumable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumableState {
    /// Created but never run past its entry point
    Created,
    /// Detached at a suspension point
    Suspended,
    /// Attached to a live frame
    Running,
    /// Finished by return or escaping exception
    Completed,
}

/// A detached activation record
pub struct Resumable {
    /// Generator or async
    pub kind: ResumableKind,
    state: ResumableState,
    /// Function body
    pub func: Rc<Func>,
    /// `$this` or static class context captured at creation
    pub subject: CallSubject,
    /// Original method name for magic calls
    pub inv_name: Option<Rc<str>>,
    /// Surplus arguments captured at entry
    pub extra_args: Option<Vec<Value>>,
    /// Arguments supplied at the original call
    pub num_args: u32,
    /// Saved locals
    pub locals: Vec<Value>,
    /// Saved iterator cursors
    pub iters: Vec<Option<IterState>>,
    /// Saved operand-stack slice, bottom first
    pub stack: Vec<Value>,
    /// Pre-live calls awaiting their `FCall`, based relative to the frame
    pub pending_calls: Vec<ActRec>,
    /// Where to continue when resumed with a value
    pub resume_pc: usize,
    /// Offset of the suspending instruction; exceptions are raised here
    pub suspend_pc: usize,
}

impl Resumable {
    /// Create a resumable that has not started yet
    pub fn new(kind: ResumableKind, func: Rc<Func>, subject: CallSubject) -> Self {
        Self {
            kind,
            state: ResumableState::Created,
            func,
            subject,
            inv_name: None,
            extra_args: None,
            num_args: 0,
            locals: Vec::new(),
            iters: Vec::new(),
            stack: Vec::new(),
            pending_calls: Vec::new(),
            resume_pc: 0,
            suspend_pc: 0,
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> ResumableState {
        self.state
    }

    /// Check for completion
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == ResumableState::Completed
    }

    /// Check whether the entry point has not run yet
    #[inline]
    pub fn is_created(&self) -> bool {
        self.state == ResumableState::Created
    }

    /// Enter the running state
    ///
    /// # Errors
    ///
    /// Returns `VmError::InvalidResume` if the resumable is already running
    /// or has completed.
    pub fn start_running(&mut self) -> VmResult<()> {
        match self.state {
            ResumableState::Created | ResumableState::Suspended => {
                self.state = ResumableState::Running;
                Ok(())
            }
            ResumableState::Running => Err(VmError::InvalidResume(format!(
                "{} is already running",
                self.func.full_name()
            ))),
            ResumableState::Completed => Err(VmError::InvalidResume(format!(
                "{} has already completed",
                self.func.full_name()
            ))),
        }
    }

    /// Store a detached frame and enter the suspended state
    ///
    /// # Errors
    ///
    /// Returns `VmError::InvalidResume` unless the resumable was running.
    pub fn suspend(
        &mut self,
        locals: Vec<Value>,
        iters: Vec<Option<IterState>>,
        stack: Vec<Value>,
        suspend_pc: usize,
        resume_pc: usize,
    ) -> VmResult<()> {
        if self.state != ResumableState::Running {
            return Err(VmError::InvalidResume(format!(
                "cannot suspend {} in state {:?}",
                self.func.full_name(),
                self.state
            )));
        }
        self.locals = locals;
        self.iters = iters;
        self.stack = stack;
        self.suspend_pc = suspend_pc;
        self.resume_pc = resume_pc;
        self.state = ResumableState::Suspended;
        Ok(())
    }

    /// Finish and release all held references
    pub fn complete(&mut self) {
        self.state = ResumableState::Completed;
        self.locals = Vec::new();
        self.iters = Vec::new();
        self.stack = Vec::new();
        self.pending_calls = Vec::new();
        self.extra_args = None;
        self.subject = CallSubject::None;
    }
}

impl fmt::Debug for Resumable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumable")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("func", &self.func.full_name())
            .field("resume_pc", &self.resume_pc)
            .field("locals", &self.locals.len())
            .field("stack", &self.stack.len())
            .finish()
    }
}

/// Payload of a `Generator` object
pub struct GeneratorData {
    /// Suspended body
    pub resumable: Rc<RefCell<Resumable>>,
    /// Key of the last yield
    pub current_key: Value,
    /// Value of the last yield
    pub current_value: Value,
    /// Next automatic integer key
    pub auto_key: i64,
    /// Value passed to the final `return`
    pub return_value: Option<Value>,
}

impl GeneratorData {
    /// Wrap a freshly created resumable
    pub fn new(resumable: Rc<RefCell<Resumable>>) -> Self {
        Self {
            resumable,
            current_key: Value::Null,
            current_value: Value::Null,
            auto_key: 0,
            return_value: None,
        }
    }

    /// Record a yielded pair; `None` keys are auto-numbered
    ///
    /// Automatic keys stop at `i64::MAX` and repeat from there.
    pub fn set_current(&mut self, key: Option<Value>, value: Value) {
        let key = match key {
            Some(k) => {
                if let Value::Int(i) = k {
                    if i >= self.auto_key {
                        self.auto_key = i.saturating_add(1);
                    }
                }
                k
            }
            None => {
                let k = Value::Int(self.auto_key);
                self.auto_key = self.auto_key.saturating_add(1);
                k
            }
        };
        self.current_key = key;
        self.current_value = value;
    }

    /// Record completion, clearing the current pair
    pub fn finish(&mut self, return_value: Value) {
        self.current_key = Value::Null;
        self.current_value = Value::Null;
        self.return_value = Some(return_value);
    }
}

/// Status of an awaitable
#[derive(Clone)]
pub enum WaitHandleState {
    /// Created for an external producer, not resolved yet
    Pending,
    /// An async function suspended awaiting `child`
    Blocked {
        /// The suspended body
        resumable: Rc<RefCell<Resumable>>,
        /// Awaited handle
        child: ObjectRef,
    },
    /// An async function currently attached to a frame
    Running(Rc<RefCell<Resumable>>),
    /// Resolved with a value
    Succeeded(Value),
    /// Resolved with an exception
    Failed(Value),
}

impl WaitHandleState {
    /// Check for a resolved handle
    pub fn is_finished(&self) -> bool {
        matches!(self, WaitHandleState::Succeeded(_) | WaitHandleState::Failed(_))
    }
}

impl fmt::Debug for WaitHandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitHandleState::Pending => write!(f, "Pending"),
            WaitHandleState::Blocked { .. } => write!(f, "Blocked"),
            WaitHandleState::Running(_) => write!(f, "Running"),
            WaitHandleState::Succeeded(v) => write!(f, "Succeeded({:?})", v),
            WaitHandleState::Failed(e) => write!(f, "Failed({:?})", e),
        }
    }
}

/// Payload of a `WaitHandle` object
#[derive(Debug)]
pub struct WaitHandleData {
    /// Current status
    pub state: WaitHandleState,
}

impl WaitHandleData {
    /// Create a payload
    pub fn new(state: WaitHandleState) -> Self {
        Self { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::UnitInfo;
    use strata_bytecode::{Function, Opcode};

    fn resumable() -> Resumable {
        let unit = Rc::new(UnitInfo {
            id: 0,
            path: Rc::from("test.hh"),
            strings: Vec::new(),
        });
        let func = Rc::new(Func {
            id: 0,
            name: Rc::from("gen"),
            def: Function::new("gen", 1, vec![Opcode::RetC.to_u8()]),
            unit,
            class: None,
            is_static: false,
        });
        Resumable::new(ResumableKind::Generator, func, CallSubject::None)
    }

    #[test]
    fn test_state_transitions() {
        let mut r = resumable();
        assert!(r.is_created());
        r.start_running().unwrap();
        assert!(matches!(r.start_running(), Err(VmError::InvalidResume(_))));

        r.suspend(vec![Value::Int(1)], vec![], vec![], 4, 5).unwrap();
        assert_eq!(r.state(), ResumableState::Suspended);
        assert_eq!(r.resume_pc, 5);

        r.start_running().unwrap();
        r.complete();
        assert!(r.is_finished());
        assert!(r.locals.is_empty());
        assert!(matches!(r.start_running(), Err(VmError::InvalidResume(_))));
        assert!(r.suspend(vec![], vec![], vec![], 0, 0).is_err());
    }

    #[test]
    fn test_suspend_requires_running() {
        let mut r = resumable();
        assert!(r.suspend(vec![], vec![], vec![], 0, 1).is_err());
    }

    #[test]
    fn test_auto_keys_follow_explicit_int_keys() {
        let mut g = GeneratorData::new(Rc::new(RefCell::new(resumable())));
        g.set_current(None, Value::str("a"));
        assert_eq!(g.current_key, Value::Int(0));
        g.set_current(Some(Value::Int(10)), Value::str("b"));
        g.set_current(None, Value::str("c"));
        assert_eq!(g.current_key, Value::Int(11));
        g.set_current(Some(Value::str("k")), Value::Null);
        g.set_current(None, Value::Null);
        assert_eq!(g.current_key, Value::Int(12));
    }

    #[test]
    fn test_auto_keys_saturate_after_max_key() {
        let mut g = GeneratorData::new(Rc::new(RefCell::new(resumable())));
        g.set_current(Some(Value::Int(i64::MAX)), Value::str("a"));
        g.set_current(None, Value::str("b"));
        assert_eq!(g.current_key, Value::Int(i64::MAX));
        g.set_current(None, Value::str("c"));
        assert_eq!(g.current_key, Value::Int(i64::MAX));
    }

    #[test]
    fn test_complete_releases_references() {
        let mut r = resumable();
        let held = Value::list(vec![]);
        let array = held.as_array().unwrap().clone();
        r.start_running().unwrap();
        r.suspend(vec![held], vec![], vec![], 0, 1).unwrap();
        assert_eq!(Rc::strong_count(&array), 2);
        r.start_running().unwrap();
        r.complete();
        assert_eq!(Rc::strong_count(&array), 1);
    }
}
