//! Built-in classes and native functions installed into every context
//!
//! Natives run without a frame of their own, so the current frame seen by
//! `func_get_args` and friends is the guest caller's.

use super::errors::{severity, ErrorThrowMode};
use super::ExecutionContext;
use crate::func::{Callee, NativeFn, NativeFunc};
use crate::object::{Class, ClassId, MethodEntry, ObjectRef, CTOR_NAME};
use crate::resumable::WaitHandleState;
use crate::value::{Array, ArrayKey, Value};
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::unit::attrs;
use strata_bytecode::Visibility;
use tracing::error;

/// Name of the base exception class
pub const EXCEPTION_CLASS: &str = "Exception";
/// Name of the class raised errors are converted to
pub const ERROR_EXCEPTION_CLASS: &str = "ErrorException";
/// Name of the generator class
pub const GENERATOR_CLASS: &str = "Generator";
/// Name of the async result class
pub const WAIT_HANDLE_CLASS: &str = "WaitHandle";

const NATIVE_FUNCTIONS: &[(&str, NativeFn)] = &[
    ("func_get_args", func_get_args),
    ("func_num_args", func_num_args),
    ("get_defined_vars", get_defined_vars),
    ("call_user_func", call_user_func),
    ("call_user_func_array", call_user_func_array),
    ("trigger_error", trigger_error),
    ("set_error_handler", set_error_handler),
    ("restore_error_handler", restore_error_handler),
    ("set_exception_handler", set_exception_handler),
    ("restore_exception_handler", restore_exception_handler),
    ("error_get_last", error_get_last),
    ("debug_backtrace", debug_backtrace),
];

impl ExecutionContext {
    pub(crate) fn register_builtins(&mut self) {
        for (name, call) in NATIVE_FUNCTIONS {
            self.natives.register(name, *call);
        }
        if let Err(err) = self.register_builtin_classes() {
            error!(target: "strata::vm", error = %err, "failed to register built-in classes");
        }
    }

    fn register_builtin_classes(&mut self) -> VmResult<()> {
        let id = self.classes.next_class_id();
        let mut exception = Class::new(id, EXCEPTION_CLASS, None);
        exception.add_prop("message", Value::str(""));
        exception.add_prop("code", Value::Int(0));
        exception.add_prop("file", Value::str(""));
        exception.add_prop("line", Value::Int(0));
        add_natives(
            &mut exception,
            &[
                (CTOR_NAME, exception_construct),
                ("getMessage", exception_get_message),
                ("getCode", exception_get_code),
                ("getFile", exception_get_file),
                ("getLine", exception_get_line),
            ],
        );
        let exception = self.classes.register_class(exception)?;
        self.classes.builtins.exception = exception.id;

        let id = self.classes.next_class_id();
        let mut error_exception = Class::new(id, ERROR_EXCEPTION_CLASS, Some(exception));
        error_exception.add_prop("severity", Value::Int(severity::E_ERROR as i64));
        add_natives(&mut error_exception, &[("getSeverity", error_exception_get_severity)]);
        self.classes.builtins.error_exception = self.classes.register_class(error_exception)?.id;

        let id = self.classes.next_class_id();
        let mut generator = Class::new(id, GENERATOR_CLASS, None);
        add_natives(
            &mut generator,
            &[
                ("current", generator_current),
                ("key", generator_key),
                ("next", generator_next),
                ("send", generator_send),
                ("throw", generator_throw),
                ("valid", generator_valid),
                ("getReturn", generator_get_return),
            ],
        );
        self.classes.builtins.generator = self.classes.register_class(generator)?.id;

        let id = self.classes.next_class_id();
        let mut wait_handle = Class::new(id, WAIT_HANDLE_CLASS, None);
        add_natives(
            &mut wait_handle,
            &[
                ("isFinished", wait_handle_is_finished),
                ("isSucceeded", wait_handle_is_succeeded),
                ("isFailed", wait_handle_is_failed),
                ("result", wait_handle_result),
            ],
        );
        self.classes.builtins.wait_handle = self.classes.register_class(wait_handle)?.id;
        Ok(())
    }
}

fn add_natives(class: &mut Class, methods: &[(&str, NativeFn)]) {
    let declaring: ClassId = class.id;
    for (name, call) in methods {
        let name: Rc<str> = Rc::from(*name);
        class.add_method(MethodEntry {
            name: Rc::clone(&name),
            callee: Callee::Native(NativeFunc { name, call: *call }),
            visibility: Visibility::Public,
            is_static: false,
            declaring,
        });
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn this_object<'a>(this: Option<&'a ObjectRef>, method: &str) -> VmResult<&'a ObjectRef> {
    this.ok_or_else(|| {
        VmError::RuntimeError(format!("Non-static method {}() cannot be called statically", method))
    })
}

fn prop(this: Option<&ObjectRef>, method: &str, name: &str) -> VmResult<Value> {
    Ok(this_object(this, method)?
        .borrow()
        .get_prop(name)
        .unwrap_or_default())
}

fn assoc<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    let mut array = Array::new();
    for (key, value) in entries {
        array.insert(ArrayKey::Str(Rc::from(key)), value);
    }
    Value::Array(array.into_ref())
}

// ============================================================================
// Exception
// ============================================================================

fn exception_construct(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let obj = this_object(this, CTOR_NAME)?;
    let mut o = obj.borrow_mut();
    if let Some(message) = args.first() {
        o.set_prop("message", Value::str(&message.to_display_string()));
    }
    if let Some(code) = args.get(1) {
        o.set_prop("code", Value::Int(code.to_int()));
    }
    Ok(Value::Null)
}

fn exception_get_message(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    prop(this, "getMessage", "message")
}

fn exception_get_code(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    prop(this, "getCode", "code")
}

fn exception_get_file(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    prop(this, "getFile", "file")
}

fn exception_get_line(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    prop(this, "getLine", "line")
}

fn error_exception_get_severity(
    _ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    prop(this, "getSeverity", "severity")
}

// ============================================================================
// Generator
// ============================================================================

fn generator_current(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "current")?;
    ctx.generator_prime(gen)?;
    if ctx.generator_finished(gen)? {
        return Ok(Value::Null);
    }
    Ok(ctx.generator_current(gen)?.1)
}

fn generator_key(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "key")?;
    ctx.generator_prime(gen)?;
    if ctx.generator_finished(gen)? {
        return Ok(Value::Null);
    }
    Ok(ctx.generator_current(gen)?.0)
}

fn generator_next(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "next")?;
    ctx.generator_send(gen, Value::Null)?;
    Ok(Value::Null)
}

fn generator_send(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "send")?;
    ctx.generator_send(gen, arg(args, 0))?;
    generator_current(ctx, this, &[])
}

fn generator_throw(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "throw")?;
    ctx.generator_throw(gen, arg(args, 0))?;
    generator_current(ctx, this, &[])
}

fn generator_valid(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let gen = this_object(this, "valid")?;
    ctx.generator_prime(gen)?;
    Ok(Value::Bool(!ctx.generator_finished(gen)?))
}

fn generator_get_return(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    ctx.generator_return_value(this_object(this, "getReturn")?)
}

// ============================================================================
// WaitHandle
// ============================================================================

fn wait_handle_is_finished(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let state = ctx.wait_handle_state(this_object(this, "isFinished")?)?;
    Ok(Value::Bool(matches!(
        state,
        WaitHandleState::Succeeded(_) | WaitHandleState::Failed(_)
    )))
}

fn wait_handle_is_succeeded(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let state = ctx.wait_handle_state(this_object(this, "isSucceeded")?)?;
    Ok(Value::Bool(matches!(state, WaitHandleState::Succeeded(_))))
}

fn wait_handle_is_failed(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let state = ctx.wait_handle_state(this_object(this, "isFailed")?)?;
    Ok(Value::Bool(matches!(state, WaitHandleState::Failed(_))))
}

fn wait_handle_result(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    ctx.wait_handle_result(this_object(this, "result")?)
}

// ============================================================================
// Functions
// ============================================================================

/// Arguments the current guest frame received, or `None` at global scope
fn caller_args(ctx: &ExecutionContext) -> VmResult<Option<Vec<Value>>> {
    let Some(fp) = ctx.regs.fp else {
        return Ok(None);
    };
    let ar = ctx.stack.frame(fp)?;
    let Some(func) = ar.func() else {
        return Ok(None);
    };
    if func.def.attrs & attrs::PSEUDO_MAIN != 0 {
        return Ok(None);
    }
    let num_args = ar.num_args as usize;
    let declared = func.def.num_positional_params();
    let mut out: Vec<Value> = (0..num_args.min(declared))
        .map(|i| ctx.stack.slot(ar.base + i).cloned().unwrap_or_default())
        .collect();
    if func.def.has_variadic() && num_args > declared {
        if let Some(Value::Array(rest)) = ctx.stack.slot(ar.base + declared) {
            out.extend(rest.borrow().values().cloned());
        }
    }
    if let Some(extra) = &ar.extra_args {
        out.extend(extra.iter().cloned());
    }
    Ok(Some(out))
}

fn func_get_args(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    match caller_args(ctx)? {
        Some(args) => Ok(Value::list(args)),
        None => {
            ctx.raise_warning("func_get_args():  Called from the global scope - no function context")?;
            Ok(Value::Bool(false))
        }
    }
}

fn get_defined_vars(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    Ok(Value::Array(ctx.get_local_defined_variables()?.into_ref()))
}

fn func_num_args(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    match caller_args(ctx)? {
        Some(args) => Ok(Value::Int(args.len() as i64)),
        None => {
            ctx.raise_warning("func_num_args():  Called from the global scope - no function context")?;
            Ok(Value::Int(-1))
        }
    }
}

fn call_user_func(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let Some((callable, rest)) = args.split_first() else {
        return Err(VmError::TypeError("call_user_func() expects at least 1 argument".into()));
    };
    ctx.call_user_func(callable, rest)
}

fn call_user_func_array(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let callable = arg(args, 0);
    let params: Vec<Value> = match arg(args, 1) {
        Value::Array(array) => array.borrow().values().cloned().collect(),
        other => {
            return Err(VmError::TypeError(format!(
                "call_user_func_array() expects parameter 2 to be array, {} given",
                other.type_name()
            )))
        }
    };
    ctx.call_user_func(&callable, &params)
}

fn trigger_error(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let msg = arg(args, 0).to_display_string();
    let errnum = args
        .get(1)
        .map_or(severity::E_USER_NOTICE as i64, Value::to_int);
    let errnum = match u32::try_from(errnum) {
        Ok(n) if n.count_ones() == 1 && n & severity::USER != 0 => n,
        _ => {
            ctx.raise_warning("Invalid error type specified")?;
            return Ok(Value::Bool(false));
        }
    };
    let mode = if errnum == severity::E_USER_ERROR {
        ErrorThrowMode::IfUnhandled
    } else {
        ErrorThrowMode::Never
    };
    ctx.handle_error(&msg, errnum, true, mode)?;
    Ok(Value::Bool(true))
}

fn set_error_handler(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let mask = args
        .get(1)
        .map_or(severity::E_ALL, |m| u32::try_from(m.to_int()).unwrap_or(severity::E_ALL));
    Ok(ctx.push_user_error_handler(arg(args, 0), mask))
}

fn restore_error_handler(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    ctx.pop_user_error_handler();
    Ok(Value::Bool(true))
}

fn set_exception_handler(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    Ok(ctx.push_user_exception_handler(arg(args, 0)))
}

fn restore_exception_handler(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    ctx.pop_user_exception_handler();
    Ok(Value::Bool(true))
}

fn error_get_last(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    Ok(match ctx.last_error() {
        Some(last) => assoc([
            ("type", Value::Int(i64::from(last.number))),
            ("message", Value::str(&last.message)),
            ("file", Value::Str(Rc::clone(&last.file))),
            ("line", Value::Int(i64::from(last.line))),
        ]),
        None => Value::Null,
    })
}

fn debug_backtrace(
    ctx: &mut ExecutionContext,
    _this: Option<&ObjectRef>,
    _args: &[Value],
) -> VmResult<Value> {
    let frames = ctx.backtrace(true).into_iter().map(|info| {
        let mut entries = vec![
            ("function", Value::Str(info.function)),
            ("file", Value::Str(info.file)),
            ("line", Value::Int(i64::from(info.line))),
        ];
        if let Some(class) = info.class {
            entries.push(("class", Value::Str(class)));
        }
        assoc(entries)
    });
    Ok(Value::list(frames))
}
