//! Suspension and resumption engine
//!
//! Suspending moves a frame's locals, iterator cursors, operand slice and
//! any pre-live calls into its [`Resumable`], then pops the frame.
//! Resuming pushes a fresh frame at the current stack cursor, moves the
//! saved state back and continues at the recorded pc, in a nested session
//! of its own.
//!
//! Generators are driven by their `Generator` object (`next`, `send`,
//! `throw`, `foreach`). Async functions run eagerly until the first `Await`
//! on an unfinished handle; after that an external scheduler resumes them
//! with [`resume_async_func`](ExecutionContext::resume_async_func).

use super::execution::{OpcodeResult, ResumeInput, Unwound};
use super::ExecutionContext;
use crate::func::{Callee, Func};
use crate::object::{Internal, ObjectRef};
use crate::resumable::{
    GeneratorData, Resumable, ResumableKind, ResumableState, WaitHandleData, WaitHandleState,
};
use crate::stack::{ar_flags, ActRec, FrameId, IterState, ResumeLink};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// A frame's state after detaching it from the stack
struct Detached {
    locals: Vec<Value>,
    iters: Vec<Option<IterState>>,
    stack: Vec<Value>,
    pending_calls: Vec<ActRec>,
    extra_args: Option<Vec<Value>>,
}

impl ExecutionContext {
    // ========================================================================
    // Detach / attach
    // ========================================================================

    /// Move everything a frame owns out of the stack, leaving it empty
    fn detach_frame(&mut self, fp: FrameId) -> VmResult<Detached> {
        let mut pending_calls = Vec::new();
        while self.stack.frame_count() > fp.index() + 1 {
            let mut ar = self
                .stack
                .pop_frame()
                .ok_or_else(|| VmError::StackCorruption("lost pre-live frame".into()))?;
            ar.base -= self.stack.frame(fp)?.base;
            pending_calls.push(ar);
        }
        pending_calls.reverse();

        let ar = self.stack.frame_mut(fp)?;
        let iters = std::mem::take(&mut ar.iters);
        let extra_args = ar.extra_args.take();
        let (base, locals_end) = (ar.base, ar.locals_end());
        let sp = self.stack.sp();
        let locals = (base..locals_end).map(|i| self.stack.take_slot(i)).collect();
        let stack = (locals_end..sp).map(|i| self.stack.take_slot(i)).collect();
        Ok(Detached {
            locals,
            iters,
            stack,
            pending_calls,
            extra_args,
        })
    }

    /// Move a detached frame's state into a resumable and mark it suspended
    fn store_detached(
        resumable: &mut Resumable,
        detached: Detached,
        suspend_pc: usize,
        resume_pc: usize,
    ) -> VmResult<()> {
        resumable.suspend(
            detached.locals,
            detached.iters,
            detached.stack,
            suspend_pc,
            resume_pc,
        )?;
        resumable.pending_calls = detached.pending_calls;
        resumable.extra_args = detached.extra_args;
        Ok(())
    }

    /// Re-attach a resumable's frame and run it until it suspends again or
    /// completes
    ///
    /// The resumable only enters the running state once its session has
    /// been entered, so a failure to enter leaves it resumable.
    pub(crate) fn cont_enter(
        &mut self,
        resumable: &Rc<RefCell<Resumable>>,
        owner: &ObjectRef,
        input: ResumeInput,
    ) -> VmResult<Value> {
        let link = ResumeLink {
            resumable: Rc::clone(resumable),
            owner: Rc::clone(owner),
        };
        self.run_session(
            move |ctx| {
                link.resumable.borrow_mut().start_running()?;
                ctx.stats.resumptions += 1;
                debug!(
                    target: "strata::resumable",
                    func = %link.resumable.borrow().func.full_name(),
                    "resume"
                );
                ctx.attach_resumed_frame(link, input)
            },
            |ctx| ctx.dispatch(),
        )
    }

    fn attach_resumed_frame(
        &mut self,
        link: ResumeLink,
        input: ResumeInput,
    ) -> VmResult<Option<Value>> {
        let (mut ar, locals, stack, pending_calls, resume_pc, suspend_pc) = {
            let mut r = link.resumable.borrow_mut();
            let mut ar = ActRec::new(
                Callee::Func(Rc::clone(&r.func)),
                r.subject.clone(),
                self.stack.sp(),
            );
            ar.num_args = r.num_args;
            ar.inv_name = r.inv_name.clone();
            ar.extra_args = r.extra_args.take();
            ar.iters = std::mem::take(&mut r.iters);
            (
                ar,
                std::mem::take(&mut r.locals),
                std::mem::take(&mut r.stack),
                std::mem::take(&mut r.pending_calls),
                r.resume_pc,
                r.suspend_pc,
            )
        };
        ar.flags = ar_flags::FROM_VM_ENTRY | ar_flags::RESUMED;
        ar.resume = Some(link);
        let base = ar.base;
        let id = self.stack.push_frame(ar);
        for value in locals {
            self.stack.push(value)?;
        }
        self.regs.first_ar = Some(id);
        self.set_frame(id, resume_pc)?;
        for value in stack {
            self.stack.push(value)?;
        }
        for mut pending in pending_calls {
            pending.base += base;
            self.stack.push_frame(pending);
        }

        match input {
            ResumeInput::Start => {}
            ResumeInput::Value(value) => self.stack.push(value)?,
            ResumeInput::Throw(exc) => match self.unwind(exc, suspend_pc)? {
                Unwound::Resume => {}
                Unwound::Returned(value) => return Ok(Some(value)),
            },
        }
        Ok(None)
    }

    /// Finish a re-attached frame's resumable and publish its outcome on the
    /// owner object
    pub(crate) fn complete_resumable(
        &mut self,
        link: &ResumeLink,
        outcome: Result<Value, Value>,
    ) -> VmResult<()> {
        let kind = {
            let mut r = link.resumable.borrow_mut();
            r.complete();
            r.kind
        };
        let mut owner = link.owner.borrow_mut();
        match (kind, &mut owner.internal) {
            (ResumableKind::Generator, Some(Internal::Generator(gen))) => {
                gen.finish(outcome.clone().unwrap_or_default());
                if outcome.is_err() {
                    gen.return_value = None;
                }
            }
            (ResumableKind::Async, Some(Internal::WaitHandle(handle))) => {
                handle.state = match outcome {
                    Ok(value) => WaitHandleState::Succeeded(value),
                    Err(exc) => WaitHandleState::Failed(exc),
                };
            }
            _ => {
                return Err(VmError::StackCorruption(
                    "resumable owner has the wrong payload".into(),
                ))
            }
        }
        debug!(target: "strata::resumable", kind = ?kind, "complete");
        Ok(())
    }

    // ========================================================================
    // Suspension opcodes
    // ========================================================================

    /// `CreateCont`: turn the current generator frame into a `Generator`
    pub(in crate::interpreter) fn create_cont(&mut self, func: &Rc<Func>) -> VmResult<OpcodeResult> {
        if !func.def.is_generator() {
            return Err(VmError::RuntimeError(format!(
                "{} is not a generator",
                func.full_name()
            )));
        }
        let fp = self.current_fp()?;
        let detached = self.detach_frame(fp)?;
        let ar = self.stack.frame_mut(fp)?;
        ar.var_env = None;
        let mut resumable = Resumable::new(ResumableKind::Generator, Rc::clone(func), ar.subject.clone());
        resumable.num_args = ar.num_args;
        resumable.inv_name = ar.inv_name.clone();
        resumable.locals = detached.locals;
        resumable.iters = detached.iters;
        resumable.stack = detached.stack;
        resumable.pending_calls = detached.pending_calls;
        resumable.extra_args = detached.extra_args;
        resumable.resume_pc = self.regs.pc;

        let gen = self.new_builtin_object(
            self.classes.builtins.generator,
            Internal::Generator(GeneratorData::new(Rc::new(RefCell::new(resumable)))),
        )?;
        debug!(target: "strata::resumable", func = %func.full_name(), "create generator");
        self.finish_frame(Value::Object(gen))
    }

    /// `Yield` / `YieldK`: publish a pair and suspend the running generator
    pub(in crate::interpreter) fn yield_value(
        &mut self,
        key: Option<Value>,
        value: Value,
        op_pc: usize,
    ) -> VmResult<OpcodeResult> {
        let fp = self.current_fp()?;
        let link = self
            .stack
            .frame(fp)?
            .resume
            .clone()
            .ok_or_else(|| VmError::RuntimeError("Cannot yield outside a running generator".into()))?;
        match &mut link.owner.borrow_mut().internal {
            Some(Internal::Generator(gen)) => gen.set_current(key, value),
            _ => return Err(VmError::RuntimeError("Cannot yield from an async function".into())),
        }
        let detached = self.detach_frame(fp)?;
        Self::store_detached(&mut link.resumable.borrow_mut(), detached, op_pc, self.regs.pc)?;
        self.stats.suspensions += 1;
        self.finish_frame(Value::Null)
    }

    /// `Await`: continue with a finished handle's result, or suspend the
    /// async frame until the scheduler resumes it
    pub(in crate::interpreter) fn await_handle(
        &mut self,
        func: &Rc<Func>,
        awaited: Value,
        op_pc: usize,
    ) -> VmResult<OpcodeResult> {
        if !func.def.is_async() {
            return Err(VmError::RuntimeError(format!(
                "Cannot await in non-async function {}",
                func.full_name()
            )));
        }
        let child = match awaited {
            Value::Object(obj) if matches!(obj.borrow().internal, Some(Internal::WaitHandle(_))) => obj,
            other => {
                return Err(VmError::TypeError(format!(
                    "Await expects a WaitHandle, {} given",
                    other.type_name()
                )))
            }
        };
        match self.wait_handle_state(&child)? {
            WaitHandleState::Succeeded(value) => {
                self.stack.push(value)?;
                return Ok(OpcodeResult::Continue);
            }
            WaitHandleState::Failed(exc) => return Ok(OpcodeResult::Throw(exc)),
            _ => {}
        }

        let fp = self.current_fp()?;
        let resume_pc = self.regs.pc;
        let existing = self.stack.frame(fp)?.resume.clone();
        let detached = self.detach_frame(fp)?;
        self.stats.suspensions += 1;
        match existing {
            Some(link) => {
                Self::store_detached(&mut link.resumable.borrow_mut(), detached, op_pc, resume_pc)?;
                if let Some(Internal::WaitHandle(handle)) = &mut link.owner.borrow_mut().internal {
                    handle.state = WaitHandleState::Blocked {
                        resumable: Rc::clone(&link.resumable),
                        child,
                    };
                }
                self.finish_frame(Value::Null)
            }
            None => {
                let ar = self.stack.frame_mut(fp)?;
                ar.var_env = None;
                let mut resumable =
                    Resumable::new(ResumableKind::Async, Rc::clone(func), ar.subject.clone());
                resumable.num_args = ar.num_args;
                resumable.inv_name = ar.inv_name.clone();
                resumable.start_running()?;
                Self::store_detached(&mut resumable, detached, op_pc, resume_pc)?;
                let handle = self.new_wait_handle(WaitHandleState::Blocked {
                    resumable: Rc::new(RefCell::new(resumable)),
                    child,
                })?;
                debug!(target: "strata::resumable", func = %func.full_name(), "async function suspended");
                self.finish_frame(Value::Object(handle))
            }
        }
    }

    // ========================================================================
    // Wait handles
    // ========================================================================

    fn new_builtin_object(&self, class: usize, internal: Internal) -> VmResult<ObjectRef> {
        let cls = self
            .classes
            .get(class)
            .cloned()
            .ok_or_else(|| VmError::Fatal("built-in classes are not registered".into()))?;
        let obj = cls.instantiate();
        obj.borrow_mut().internal = Some(internal);
        Ok(obj)
    }

    fn new_wait_handle(&self, state: WaitHandleState) -> VmResult<ObjectRef> {
        self.new_builtin_object(
            self.classes.builtins.wait_handle,
            Internal::WaitHandle(WaitHandleData::new(state)),
        )
    }

    /// A wait handle already resolved with `outcome`
    pub(crate) fn finished_wait_handle(&self, outcome: Result<Value, Value>) -> VmResult<Value> {
        let state = match outcome {
            Ok(value) => WaitHandleState::Succeeded(value),
            Err(exc) => WaitHandleState::Failed(exc),
        };
        self.new_wait_handle(state).map(Value::Object)
    }

    /// Create an unresolved wait handle for an external producer
    ///
    /// # Errors
    ///
    /// Returns `VmError::Fatal` if the built-in classes are missing.
    pub fn create_pending_wait_handle(&self) -> VmResult<ObjectRef> {
        self.new_wait_handle(WaitHandleState::Pending)
    }

    /// Current state of a wait handle
    ///
    /// # Errors
    ///
    /// Returns `VmError::TypeError` if `handle` is not a wait handle.
    pub fn wait_handle_state(&self, handle: &ObjectRef) -> VmResult<WaitHandleState> {
        match &handle.borrow().internal {
            Some(Internal::WaitHandle(data)) => Ok(data.state.clone()),
            _ => Err(VmError::TypeError("object is not a WaitHandle".into())),
        }
    }

    /// The handle an async function is blocked on
    pub fn blocked_on(&self, handle: &ObjectRef) -> Option<ObjectRef> {
        match self.wait_handle_state(handle).ok()? {
            WaitHandleState::Blocked { child, .. } => Some(child),
            _ => None,
        }
    }

    /// Result of a finished wait handle
    ///
    /// # Errors
    ///
    /// - `VmError::Exception` carrying the failure of a failed handle
    /// - `VmError::RuntimeError` if the handle has not finished
    pub fn wait_handle_result(&self, handle: &ObjectRef) -> VmResult<Value> {
        match self.wait_handle_state(handle)? {
            WaitHandleState::Succeeded(value) => Ok(value),
            WaitHandleState::Failed(exc) => Err(VmError::Exception(exc)),
            _ => Err(VmError::RuntimeError("WaitHandle has not finished".into())),
        }
    }

    fn resolve_pending(&self, handle: &ObjectRef, state: WaitHandleState) -> VmResult<()> {
        match &mut handle.borrow_mut().internal {
            Some(Internal::WaitHandle(data)) if matches!(data.state, WaitHandleState::Pending) => {
                data.state = state;
                Ok(())
            }
            Some(Internal::WaitHandle(_)) => Err(VmError::InvalidResume(
                "only pending wait handles can be resolved externally".into(),
            )),
            _ => Err(VmError::TypeError("object is not a WaitHandle".into())),
        }
    }

    /// Resolve a pending handle with a value
    ///
    /// # Errors
    ///
    /// Returns `VmError::InvalidResume` unless the handle is pending.
    pub fn succeed_wait_handle(&self, handle: &ObjectRef, value: Value) -> VmResult<()> {
        self.resolve_pending(handle, WaitHandleState::Succeeded(value))
    }

    /// Resolve a pending handle with an exception
    ///
    /// # Errors
    ///
    /// Returns `VmError::InvalidResume` unless the handle is pending.
    pub fn fail_wait_handle(&self, handle: &ObjectRef, exc: Value) -> VmResult<()> {
        self.resolve_pending(handle, WaitHandleState::Failed(exc))
    }

    fn take_blocked(&self, handle: &ObjectRef) -> VmResult<(Rc<RefCell<Resumable>>, ObjectRef)> {
        match &mut handle.borrow_mut().internal {
            Some(Internal::WaitHandle(data)) => match &data.state {
                WaitHandleState::Blocked { resumable, child } => {
                    let taken = (Rc::clone(resumable), Rc::clone(child));
                    data.state = WaitHandleState::Running(Rc::clone(resumable));
                    Ok(taken)
                }
                other => Err(VmError::InvalidResume(format!(
                    "async function is not blocked ({:?})",
                    other
                ))),
            },
            _ => Err(VmError::TypeError("object is not a WaitHandle".into())),
        }
    }

    fn resume_blocked(&mut self, handle: &ObjectRef, input: ResumeInput) -> VmResult<()> {
        let (resumable, child) = self.take_blocked(handle)?;
        let result = self.cont_enter(&resumable, handle, input).map(|_| ());
        if result.is_err() && resumable.borrow().state() == ResumableState::Suspended {
            // The frame never re-attached; put the handle back as it was.
            if let Some(Internal::WaitHandle(data)) = &mut handle.borrow_mut().internal {
                if matches!(data.state, WaitHandleState::Running(_)) {
                    data.state = WaitHandleState::Blocked { resumable, child };
                }
            }
        }
        result
    }

    /// Resume a blocked async function; its `Await` evaluates to `value`
    ///
    /// Runs until the function awaits again or finishes; the handle's state
    /// reports which.
    ///
    /// # Errors
    ///
    /// - `VmError::InvalidResume` if the handle is not blocked
    /// - Fatal errors raised while the function ran
    pub fn resume_async_func(&mut self, handle: &ObjectRef, value: Value) -> VmResult<()> {
        self.resume_blocked(handle, ResumeInput::Value(value))
    }

    /// Resume a blocked async function by throwing `exc` at its `Await`
    ///
    /// # Errors
    ///
    /// Same as [`resume_async_func`](Self::resume_async_func).
    pub fn resume_async_func_throw(&mut self, handle: &ObjectRef, exc: Value) -> VmResult<()> {
        self.resume_blocked(handle, ResumeInput::Throw(exc))
    }

    // ========================================================================
    // Generators
    // ========================================================================

    fn generator_resumable(&self, gen: &ObjectRef) -> VmResult<Rc<RefCell<Resumable>>> {
        match &gen.borrow().internal {
            Some(Internal::Generator(data)) => Ok(Rc::clone(&data.resumable)),
            _ => Err(VmError::TypeError("object is not a Generator".into())),
        }
    }

    /// Run a generator that has not started to its first yield
    ///
    /// # Errors
    ///
    /// Whatever the generator body throws.
    pub fn generator_prime(&mut self, gen: &ObjectRef) -> VmResult<()> {
        let resumable = self.generator_resumable(gen)?;
        if resumable.borrow().is_created() {
            self.cont_enter(&resumable, gen, ResumeInput::Start)?;
        }
        Ok(())
    }

    /// Whether a generator has returned or thrown
    ///
    /// # Errors
    ///
    /// Returns `VmError::TypeError` if `gen` is not a generator.
    pub fn generator_finished(&self, gen: &ObjectRef) -> VmResult<bool> {
        Ok(self.generator_resumable(gen)?.borrow().is_finished())
    }

    /// Current `(key, value)` pair of a generator
    ///
    /// # Errors
    ///
    /// Returns `VmError::TypeError` if `gen` is not a generator.
    pub fn generator_current(&self, gen: &ObjectRef) -> VmResult<(Value, Value)> {
        match &gen.borrow().internal {
            Some(Internal::Generator(data)) => {
                Ok((data.current_key.clone(), data.current_value.clone()))
            }
            _ => Err(VmError::TypeError("object is not a Generator".into())),
        }
    }

    /// Resume a generator; its pending `Yield` evaluates to `value`
    ///
    /// A generator that has not started runs to its first yield first.
    ///
    /// # Errors
    ///
    /// Whatever the generator body throws, or `VmError::InvalidResume` if it
    /// is already running.
    pub fn generator_send(&mut self, gen: &ObjectRef, value: Value) -> VmResult<()> {
        self.generator_prime(gen)?;
        let resumable = self.generator_resumable(gen)?;
        if resumable.borrow().is_finished() {
            return Ok(());
        }
        self.cont_enter(&resumable, gen, ResumeInput::Value(value))
            .map(|_| ())
    }

    /// Throw `exc` into a generator at its pending `Yield`
    ///
    /// # Errors
    ///
    /// `VmError::Exception` if the generator does not catch it, including
    /// when it has already finished.
    pub fn generator_throw(&mut self, gen: &ObjectRef, exc: Value) -> VmResult<()> {
        self.generator_prime(gen)?;
        let resumable = self.generator_resumable(gen)?;
        if resumable.borrow().is_finished() {
            return Err(VmError::Exception(exc));
        }
        self.cont_enter(&resumable, gen, ResumeInput::Throw(exc))
            .map(|_| ())
    }

    /// Value a finished generator returned
    ///
    /// # Errors
    ///
    /// Returns `VmError::RuntimeError` if the generator has not returned.
    pub fn generator_return_value(&self, gen: &ObjectRef) -> VmResult<Value> {
        match &gen.borrow().internal {
            Some(Internal::Generator(data)) => data.return_value.clone().ok_or_else(|| {
                VmError::RuntimeError(
                    "Cannot get return value of a generator that hasn't returned".into(),
                )
            }),
            _ => Err(VmError::TypeError("object is not a Generator".into())),
        }
    }
}
