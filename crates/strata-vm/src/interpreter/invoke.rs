//! Invocation protocol
//!
//! Turns a resolved callable, a call subject and argument values into an
//! executing activation record. Both the `FCall` opcode and the native-side
//! entry points (`invoke_func`, `invoke_func_few`, `invoke_unit`) converge on
//! [`prepare_func_entry`](ExecutionContext::prepare_func_entry).
//!
//! # Argument trimming
//!
//! A frame whose stack still holds more arguments than the callee declares
//! is *untrimmed*. Trimming routes the surplus to the variadic parameter if
//! there is one, else to the extra-args side table if the callee accepts
//! extra arguments, else applies [`ExcessArgsPolicy`].

use super::context::ExcessArgsPolicy;
use super::execution::OpcodeResult;
use super::lookup::LookupResult;
use super::ExecutionContext;
use crate::func::{Callee, Func, NativeFunc, UnitId};
use crate::object::{Class, ObjectRef};
use crate::stack::{ar_flags, ActRec, CallSubject, FrameId, VarEnv};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::attrs;

/// Whether the stack above a frame's base has been reduced to the declared
/// parameters yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackArgsState {
    /// May hold surplus arguments
    Untrimmed,
    /// Holds exactly the declared positional parameters (plus the variadic)
    Trimmed,
}

/// Entry-point flavour for native-side invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeFlags {
    /// Ordinary function or method call
    Normal,
    /// A unit's top-level code, run against a variable environment
    PseudoMain,
}

/// A resolved callable ready to invoke
#[derive(Debug, Clone)]
pub struct CallCtx {
    /// Target body
    pub callee: Callee,
    /// `$this` or static class
    pub subject: CallSubject,
    /// Original method name when `callee` is a magic catch-all
    pub inv_name: Option<Rc<str>>,
}

impl CallCtx {
    /// Call a free function or native
    pub fn function(callee: Callee) -> Self {
        Self {
            callee,
            subject: CallSubject::None,
            inv_name: None,
        }
    }
}

impl ExecutionContext {
    // ========================================================================
    // Native-side entry points
    // ========================================================================

    /// Invoke a callable with arbitrary arguments in a nested session
    ///
    /// `var_env`, if given, seeds named non-parameter locals at entry and
    /// receives every named local back when the frame exits.
    ///
    /// # Errors
    ///
    /// Returns the callee's escaping exception as `VmError::Exception`, or
    /// any fatal error raised while it ran.
    pub fn invoke_func(
        &mut self,
        call: &CallCtx,
        args: &[Value],
        var_env: Option<VarEnv>,
        flags: InvokeFlags,
    ) -> VmResult<Value> {
        if self.terminated {
            return Err(VmError::RequestTerminated);
        }
        let func = match &call.callee {
            Callee::Native(native) => return self.call_native(native, call.subject.this(), args),
            Callee::Func(f) => f,
        };
        if flags == InvokeFlags::PseudoMain && func.def.attrs & attrs::PSEUDO_MAIN == 0 {
            return Err(VmError::RuntimeError(format!(
                "{} is not a pseudo-main",
                func.full_name()
            )));
        }
        self.run_session(
            |ctx| {
                ctx.enter_vm_at_func(call, args.iter().cloned(), var_env)?;
                Ok(None)
            },
            |ctx| ctx.dispatch(),
        )
    }

    /// Invoke a callable with a small literal argument vector
    ///
    /// The arguments move onto the stack without cloning.
    ///
    /// # Errors
    ///
    /// Same as [`invoke_func`](Self::invoke_func).
    pub fn invoke_func_few<const N: usize>(
        &mut self,
        call: &CallCtx,
        args: [Value; N],
    ) -> VmResult<Value> {
        if self.terminated {
            return Err(VmError::RequestTerminated);
        }
        if let Callee::Native(native) = &call.callee {
            return self.call_native(native, call.subject.this(), &args);
        }
        self.run_session(
            |ctx| {
                ctx.enter_vm_at_func(call, args, None)?;
                Ok(None)
            },
            |ctx| ctx.dispatch(),
        )
    }

    /// Invoke a callable one basic block at a time, calling `observer`
    /// between blocks
    ///
    /// # Errors
    ///
    /// Same as [`invoke_func`](Self::invoke_func), plus any error the
    /// observer returns.
    pub fn invoke_func_stepped<F>(
        &mut self,
        call: &CallCtx,
        args: &[Value],
        observer: F,
    ) -> VmResult<Value>
    where
        F: FnMut(&mut ExecutionContext) -> VmResult<()>,
    {
        if self.terminated {
            return Err(VmError::RequestTerminated);
        }
        if let Callee::Native(native) = &call.callee {
            return self.call_native(native, call.subject.this(), args);
        }
        self.run_session(
            |ctx| {
                ctx.enter_vm_at_func(call, args.iter().cloned(), None)?;
                Ok(None)
            },
            move |ctx| {
                let mut observer = observer;
                loop {
                    match ctx.dispatch_bb()? {
                        super::BlockExit::Returned(value) => return Ok(value),
                        super::BlockExit::Continue => observer(ctx)?,
                    }
                }
            },
        )
    }

    /// Run a unit's pseudo-main against the request's global environment
    ///
    /// # Errors
    ///
    /// Returns `VmError::RuntimeError` if the unit is unknown or has no
    /// pseudo-main, otherwise as [`invoke_func`](Self::invoke_func).
    pub fn invoke_unit(&mut self, unit: UnitId) -> VmResult<Value> {
        let main = self
            .units
            .unit(unit)
            .ok_or_else(|| VmError::RuntimeError(format!("unit {} is not loaded", unit)))?
            .main
            .clone()
            .ok_or_else(|| VmError::RuntimeError(format!("unit {} has no pseudo-main", unit)))?;
        let env = Rc::clone(&self.globals);
        self.invoke_func(
            &CallCtx::function(Callee::Func(main)),
            &[],
            Some(env),
            InvokeFlags::PseudoMain,
        )
    }

    /// Resolve and invoke a guest callable (`"f"`, `"C::m"`, `[obj, "m"]`,
    /// `["C", "m"]`)
    ///
    /// # Errors
    ///
    /// Resolution errors from [`resolve_callable`](Self::resolve_callable),
    /// otherwise as [`invoke_func`](Self::invoke_func).
    pub fn call_user_func(&mut self, callable: &Value, args: &[Value]) -> VmResult<Value> {
        let call = self.resolve_callable(callable)?;
        self.invoke_func(&call, args, None, InvokeFlags::Normal)
    }

    pub(crate) fn call_native(
        &mut self,
        native: &NativeFunc,
        this: Option<&ObjectRef>,
        args: &[Value],
    ) -> VmResult<Value> {
        self.stats.native_calls += 1;
        (native.call)(self, this, args)
    }

    // ========================================================================
    // Callable resolution
    // ========================================================================

    /// Resolve a guest callable value to a call context
    ///
    /// # Errors
    ///
    /// - `VmError::FunctionNotFound` for an unknown function name
    /// - `VmError::ClassNotFound` / `VmError::MethodNotFound` for methods
    /// - `VmError::TypeError` for values that are not callables
    pub fn resolve_callable(&self, callable: &Value) -> VmResult<CallCtx> {
        match callable {
            Value::Str(name) => match name.split_once("::") {
                Some((class, method)) => self.resolve_cls_callable(class, method),
                None => self.resolve_function(name),
            },
            Value::Array(parts) => {
                let parts = parts.borrow();
                let (Some((_, target)), Some((_, method)), 2) =
                    (parts.get_index(0), parts.get_index(1), parts.len())
                else {
                    return Err(VmError::TypeError("Array callback must have exactly two elements".into()));
                };
                let method = method
                    .as_str()
                    .ok_or_else(|| VmError::TypeError("Array callback method must be a string".into()))?;
                match target {
                    Value::Object(obj) => {
                        let cls = Rc::clone(&obj.borrow().class);
                        let ctx = self.get_context_class();
                        let found = self.lookup_obj_method(&cls, method, ctx.as_deref());
                        Self::call_ctx_for(found, Some(obj), &cls, method)
                            .ok_or_else(|| self.method_lookup_error(&cls, method, ctx.as_deref()))
                    }
                    Value::Str(class) => self.resolve_cls_callable(class, method),
                    other => Err(VmError::TypeError(format!(
                        "Array callback target must be an object or class name, {} given",
                        other.type_name()
                    ))),
                }
            }
            other => Err(VmError::TypeError(format!(
                "{} is not a valid callback",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn resolve_function(&self, name: &str) -> VmResult<CallCtx> {
        if let Some(func) = self.units.function(name) {
            return Ok(CallCtx::function(Callee::Func(Rc::clone(func))));
        }
        match self.natives.get(name) {
            Some(native) => Ok(CallCtx::function(Callee::Native(native.clone()))),
            None => Err(VmError::FunctionNotFound(name.to_string())),
        }
    }

    fn resolve_cls_callable(&self, class: &str, method: &str) -> VmResult<CallCtx> {
        let cls = self.classes.require(class)?;
        let this = self.current_this();
        let ctx = self.get_context_class();
        let found = self.lookup_cls_method(&cls, method, this.as_ref(), ctx.as_deref());
        Self::call_ctx_for(found, this.as_ref(), &cls, method)
            .ok_or_else(|| self.method_lookup_error(&cls, method, ctx.as_deref()))
    }

    /// Turn a lookup result into a call context; `None` for `MethodNotFound`
    pub(crate) fn call_ctx_for(
        found: LookupResult,
        this: Option<&ObjectRef>,
        cls: &Rc<Class>,
        name: &str,
    ) -> Option<CallCtx> {
        let object = |callee: Callee, inv_name: Option<Rc<str>>| match this {
            Some(obj) => CallCtx {
                callee,
                subject: CallSubject::Object(Rc::clone(obj)),
                inv_name,
            },
            None => CallCtx {
                callee,
                subject: CallSubject::Class(Rc::clone(cls)),
                inv_name,
            },
        };
        match found {
            LookupResult::MethodFoundWithThis(callee) => Some(object(callee, None)),
            LookupResult::MethodFoundNoThis(callee) => Some(CallCtx {
                callee,
                subject: CallSubject::Class(Rc::clone(cls)),
                inv_name: None,
            }),
            LookupResult::MagicCallFound(callee) => Some(object(callee, Some(Rc::from(name)))),
            LookupResult::MagicCallStaticFound(callee) => Some(CallCtx {
                callee,
                subject: CallSubject::Class(Rc::clone(cls)),
                inv_name: Some(Rc::from(name)),
            }),
            LookupResult::MethodNotFound => None,
        }
    }

    // ========================================================================
    // Frame entry
    // ========================================================================

    /// Push the entry frame of a nested session and make it current
    fn enter_vm_at_func<I>(
        &mut self,
        call: &CallCtx,
        args: I,
        var_env: Option<VarEnv>,
    ) -> VmResult<FrameId>
    where
        I: IntoIterator<Item = Value>,
    {
        let base = self.stack.sp();
        let mut num_args = 0u32;
        for arg in args {
            self.stack.push(arg)?;
            num_args += 1;
        }
        let mut ar = ActRec::new(call.callee.clone(), call.subject.clone(), base);
        ar.num_args = num_args;
        ar.var_env = var_env;
        ar.set_flag(ar_flags::FROM_VM_ENTRY);
        if let Some(name) = &call.inv_name {
            ar.inv_name = Some(Rc::clone(name));
            ar.set_flag(ar_flags::MAGIC_CALL);
        }
        let id = self.stack.push_frame(ar);
        if call.inv_name.is_some() {
            self.shuffle_magic_args(id)?;
        }
        self.shuffle_extra_stack_args(id)?;
        self.prepare_func_entry(id, StackArgsState::Trimmed)?;
        self.regs.first_ar = Some(id);
        self.enter_frame(id)?;
        Ok(id)
    }

    /// Make a prepared frame current at pc 0 and service the entry surprise
    /// check
    pub(crate) fn enter_frame(&mut self, id: FrameId) -> VmResult<()> {
        self.check_surprise()?;
        if let Some(func) = self.stack.frame(id)?.func() {
            if self.code_cache.is_invalidated(func) {
                self.stats.invalidated_entries += 1;
            }
        }
        self.stats.calls += 1;
        self.set_frame(id, 0)
    }

    /// Repackage a magic call's arguments as `(name, [args...])`
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the frame has no invocation
    /// name or its arguments are not on top of the stack.
    pub fn shuffle_magic_args(&mut self, id: FrameId) -> VmResult<()> {
        let ar = self.stack.frame(id)?;
        let name = ar
            .inv_name
            .clone()
            .ok_or_else(|| VmError::StackCorruption("magic call without a method name".into()))?;
        let num_args = ar.num_args as usize;
        if self.stack.sp() != ar.base + num_args {
            return Err(VmError::StackCorruption(format!(
                "magic call to {} expects {} arguments on the stack",
                name, num_args
            )));
        }
        let args = self.stack.pop_n(num_args)?;
        self.stack.push(Value::Str(name))?;
        self.stack.push(Value::list(args))?;
        let ar = self.stack.frame_mut(id)?;
        ar.num_args = 2;
        ar.set_flag(ar_flags::MAGIC_CALL);
        Ok(())
    }

    /// Trim surplus arguments off an untrimmed frame
    ///
    /// # Errors
    ///
    /// - `VmError::TooManyArguments` under [`ExcessArgsPolicy::Error`]
    /// - Whatever the `E_WARNING` raised under
    ///   [`ExcessArgsPolicy::WarnAndDrop`] escalates to
    pub fn shuffle_extra_stack_args(&mut self, id: FrameId) -> VmResult<()> {
        let ar = self.stack.frame(id)?;
        let Some(func) = ar.func().cloned() else {
            return Ok(());
        };
        let num_args = ar.num_args as usize;
        let declared = func.def.num_positional_params();
        if num_args <= declared {
            return Ok(());
        }
        let excess: Vec<Value> = self.stack.pop_n(num_args - declared)?.into_iter().collect();
        if func.def.has_variadic() {
            self.stack.push(Value::list(excess))?;
        } else if func.def.accepts_extra_args() {
            self.stack.frame_mut(id)?.extra_args = Some(excess);
        } else {
            match self.options.excess_args {
                ExcessArgsPolicy::Drop => {}
                ExcessArgsPolicy::WarnAndDrop => {
                    drop(excess);
                    self.raise_warning(&format!(
                        "{}() expects at most {} arguments, {} given",
                        func.full_name(),
                        declared,
                        num_args
                    ))?;
                }
                ExcessArgsPolicy::Error => {
                    return Err(VmError::TooManyArguments {
                        function: func.full_name(),
                        passed: num_args,
                        declared,
                    })
                }
            }
        }
        Ok(())
    }

    /// Bind parameters and initialize the remaining locals of a pre-live
    /// frame
    ///
    /// Missing parameters take their defaults; a missing parameter without a
    /// default is fatal. An absent variadic argument list becomes an empty
    /// array.
    ///
    /// # Errors
    ///
    /// - `VmError::TooFewArguments` for a missing required parameter
    /// - `VmError::StackCorruption` if the stack does not match the frame
    pub fn prepare_func_entry(&mut self, id: FrameId, state: StackArgsState) -> VmResult<()> {
        if state == StackArgsState::Untrimmed {
            self.shuffle_extra_stack_args(id)?;
        }
        let ar = self.stack.frame(id)?;
        let func = ar
            .func()
            .cloned()
            .ok_or_else(|| VmError::StackCorruption("native callee in a guest frame".into()))?;
        let (base, num_args) = (ar.base, ar.num_args as usize);
        let var_env = ar.var_env.clone();
        let def = &func.def;
        let declared = def.num_positional_params();
        let passed = num_args.min(declared);
        let expected = base + passed + usize::from(def.has_variadic() && num_args > declared);
        if self.stack.sp() != expected {
            return Err(VmError::StackCorruption(format!(
                "{}: stack holds {} slots for {} arguments",
                func.full_name(),
                self.stack.sp() - base,
                num_args
            )));
        }

        for param in &def.params[passed..declared] {
            match &param.default {
                Some(default) => self.stack.push(Value::from(default))?,
                None => {
                    return Err(VmError::TooFewArguments {
                        function: func.full_name(),
                        passed: num_args,
                        required: def
                            .params
                            .iter()
                            .filter(|p| p.default.is_none() && !p.variadic)
                            .count(),
                    })
                }
            }
        }
        if def.has_variadic() && num_args <= declared {
            self.stack.push(Value::list(Vec::new()))?;
        }
        let locals_end = base + def.local_count as usize;
        while self.stack.sp() < locals_end {
            self.stack.push(Value::Null)?;
        }
        self.stack.frame_mut(id)?.iters = vec![None; def.iter_count as usize];

        if let Some(env) = var_env {
            let env = env.borrow();
            for (i, name) in def.local_names.iter().enumerate().skip(def.params.len()) {
                if let Some(v) = env.get(name.as_str()) {
                    self.stack.set_slot(base + i, v.clone())?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Frame exit
    // ========================================================================

    /// Return `value` from the current frame
    ///
    /// Async frames that never suspended hand back a finished wait handle;
    /// re-attached frames complete their resumable.
    pub(crate) fn ret_from_frame(&mut self, value: Value) -> VmResult<OpcodeResult> {
        let fp = self.current_fp()?;
        self.write_back_var_env(fp)?;
        let ar = self.stack.frame(fp)?;
        let is_async = ar.func().is_some_and(|f| f.def.is_async());
        let value = match ar.resume.clone() {
            Some(link) => {
                self.complete_resumable(&link, Ok(value))?;
                Value::Null
            }
            None if is_async => self.finished_wait_handle(Ok(value))?,
            None => value,
        };
        self.finish_frame(value)
    }

    /// Pop the current frame and continue in its caller
    ///
    /// Leaves the dispatch loop if the frame was a session entry frame.
    pub(crate) fn finish_frame(&mut self, value: Value) -> VmResult<OpcodeResult> {
        let fp = self.current_fp()?;
        self.stack.truncate_frames(fp.index() + 1);
        let ar = self
            .stack
            .pop_frame()
            .ok_or_else(|| VmError::StackCorruption("return with no frame".into()))?;
        self.stack.truncate(ar.base);
        if ar.has_flag(ar_flags::FROM_VM_ENTRY) {
            self.regs.fp = None;
            return Ok(OpcodeResult::Return(value));
        }
        let prev = ar
            .prev
            .ok_or_else(|| VmError::StackCorruption("frame without caller".into()))?;
        self.set_frame(prev, ar.saved_pc)?;
        if !ar.has_flag(ar_flags::CTOR) {
            self.stack.push(value)?;
        }
        Ok(OpcodeResult::FrameChanged)
    }

    /// Copy named locals of a frame back into its variable environment
    pub(crate) fn write_back_var_env(&mut self, id: FrameId) -> VmResult<()> {
        let ar = self.stack.frame(id)?;
        let (Some(env), Some(func)) = (&ar.var_env, ar.func()) else {
            return Ok(());
        };
        let mut env = env.borrow_mut();
        for (i, name) in func.def.local_names.iter().enumerate() {
            let value = self.stack.slot(ar.base + i).cloned().unwrap_or_default();
            env.insert(Rc::from(name.as_str()), value);
        }
        Ok(())
    }

    // ========================================================================
    // Frame helpers
    // ========================================================================

    /// Make `id` the current frame at `pc`
    pub(crate) fn set_frame(&mut self, id: FrameId, pc: usize) -> VmResult<()> {
        let floor = self.stack.frame(id)?.locals_end();
        self.regs.fp = Some(id);
        self.regs.pc = pc;
        self.stack.set_floor(floor);
        Ok(())
    }

    pub(crate) fn current_fp(&self) -> VmResult<FrameId> {
        self.regs
            .fp
            .ok_or_else(|| VmError::StackCorruption("no current frame".into()))
    }

    pub(crate) fn current_func(&self) -> VmResult<Rc<Func>> {
        let ar = self.stack.frame(self.current_fp()?)?;
        ar.func()
            .cloned()
            .ok_or_else(|| VmError::StackCorruption("current frame is native".into()))
    }

    /// `$this` of the current frame
    pub fn current_this(&self) -> Option<ObjectRef> {
        let fp = self.regs.fp?;
        self.stack.frame(fp).ok()?.subject.this().cloned()
    }

    /// Read a local of the current frame
    pub(crate) fn local(&self, index: usize) -> VmResult<Value> {
        let ar = self.stack.frame(self.current_fp()?)?;
        if index >= ar.local_count() {
            return Err(VmError::StackCorruption(format!("local {} out of range", index)));
        }
        Ok(self.stack.slot(ar.base + index).cloned().unwrap_or_default())
    }

    /// Write a local of the current frame
    pub(crate) fn set_local(&mut self, index: usize, value: Value) -> VmResult<()> {
        let ar = self.stack.frame(self.current_fp()?)?;
        if index >= ar.local_count() {
            return Err(VmError::StackCorruption(format!("local {} out of range", index)));
        }
        let slot = ar.base + index;
        self.stack.set_slot(slot, value)
    }
}
