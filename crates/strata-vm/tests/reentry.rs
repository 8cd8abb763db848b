//! Nested re-entry from native code
//!
//! These tests verify:
//! - Natives calling back into the interpreter run as nested sessions
//! - Outer registers survive a nested session on every exit path
//! - Exceptions cross the native boundary and stay catchable outside it
//! - Backtraces walk across session boundaries
//! - The nesting depth limit

mod common;

use common::*;
use strata_bytecode::{BytecodeWriter, Function, Opcode, Unit};
use strata_vm::{ExecutionContext, ObjectRef, ResourceLimits, Value, VmError, VmOptions, VmResult};

fn report_depth(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    Ok(Value::Int(ctx.nesting_level() as i64))
}

/// Call `args[0]` and report whether the caller's registers came back intact
fn call_and_compare(
    ctx: &mut ExecutionContext,
    _: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let before = (ctx.pc(), ctx.fp(), ctx.stack().sp(), ctx.stack().frame_count());
    let result = ctx.call_user_func(&args[0], &[]);
    let after = (ctx.pc(), ctx.fp(), ctx.stack().sp(), ctx.stack().frame_count());
    let value = match result {
        Ok(v) => v,
        Err(VmError::Exception(_)) => Value::str("threw"),
        Err(err) => return Err(err),
    };
    Ok(Value::list(vec![value, Value::Bool(before == after)]))
}

/// `function inner() { return report_depth(); }`
fn inner_reporter(unit: &mut Unit) {
    let reporter = unit.intern("report_depth");
    let mut w = BytecodeWriter::new();
    w.emit_push_func(reporter);
    w.emit_call(0);
    unit.add_function(Function::new("inner", 0, ret(w)));
}

/// `function name() { return via(target); }`
fn forwarder(unit: &mut Unit, name: &str, via: &str, target: &str) {
    let via = unit.intern(via);
    let target = unit.intern(target);
    let mut w = BytecodeWriter::new();
    w.emit_push_func(via);
    w.emit_string(target);
    w.emit_call(1);
    unit.add_function(Function::new(name, 0, ret(w)));
}

// ===== Sessions =====

#[test]
fn test_native_callback_runs_nested() {
    let (mut ctx, _) = context();
    ctx.register_native("report_depth", report_depth);
    let mut unit = Unit::new("nested.st");
    inner_reporter(&mut unit);
    forwarder(&mut unit, "outer", "call_user_func", "inner");
    load(&mut ctx, unit);

    // Top-level entry from the host is not nested.
    assert_eq!(call(&mut ctx, "inner", &[]).unwrap(), Value::Int(0));
    assert_eq!(call(&mut ctx, "outer", &[]).unwrap(), Value::Int(1));

    let stats = ctx.stats();
    assert_eq!(stats.reentries, 1);
    assert_eq!(stats.max_nesting, 1);
    assert_eq!(ctx.nesting_level(), 0);
    assert_eq!(ctx.stack().sp(), 0);
}

#[test]
fn test_registers_restored_after_return_and_throw() {
    let (mut ctx, _) = context();
    ctx.register_native("call_and_compare", call_and_compare);
    let mut unit = Unit::new("restore.st");
    let exception = unit.intern("Exception");
    let boom = unit.intern("boom");
    inner_reporter(&mut unit);
    ctx.register_native("report_depth", report_depth);

    let mut w = BytecodeWriter::new();
    emit_throw_new(&mut w, exception, boom);
    unit.add_function(Function::new("thrower", 0, w.into_bytes()));

    forwarder(&mut unit, "returns", "call_and_compare", "inner");
    forwarder(&mut unit, "throws", "call_and_compare", "thrower");
    load(&mut ctx, unit);

    let returned = elements(&call(&mut ctx, "returns", &[]).unwrap());
    assert_eq!(returned, vec![Value::Int(1), Value::Bool(true)]);

    let thrown = elements(&call(&mut ctx, "throws", &[]).unwrap());
    assert_eq!(thrown, vec![Value::str("threw"), Value::Bool(true)]);
    assert_eq!(ctx.nesting_level(), 0);
}

// ===== Exceptions across the boundary =====

#[test]
fn test_exception_caught_outside_native_frame() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("boundary.st");
    let exception = unit.intern("Exception");
    let boom = unit.intern("boom");
    let cuf = unit.intern("call_user_func");
    let inner = unit.intern("inner");
    let get_message = unit.intern("getMessage");

    let mut w = BytecodeWriter::new();
    emit_throw_new(&mut w, exception, boom);
    unit.add_function(Function::new("inner", 0, w.into_bytes()));

    // try { return call_user_func("inner"); } catch (Exception $e) { return $e->getMessage(); }
    let mut w = BytecodeWriter::new();
    let start = w.offset();
    w.emit_push_func(cuf);
    w.emit_string(inner);
    w.emit_call(1);
    w.emit_opcode(Opcode::RetC);
    let handler = w.offset();
    w.emit_push_obj_method(get_message);
    w.emit_call(0);
    let mut outer = Function::new("outer", 0, ret(w));
    outer.handlers.push(region(start, handler, handler));
    unit.add_function(outer);
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "outer", &[]).unwrap(), Value::str("boom"));
    assert_eq!(ctx.nesting_level(), 0);
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
}

#[test]
fn test_uncaught_exception_reaches_host() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("boundary.st");
    let exception = unit.intern("Exception");
    let boom = unit.intern("boom");
    let mut w = BytecodeWriter::new();
    emit_throw_new(&mut w, exception, boom);
    unit.add_function(Function::new("inner", 0, w.into_bytes()));
    forwarder(&mut unit, "outer", "call_user_func", "inner");
    load(&mut ctx, unit);

    let err = call(&mut ctx, "outer", &[]).unwrap_err();
    assert_eq!(
        thrown(&err),
        Some(("Exception".to_string(), "boom".to_string()))
    );
    assert_eq!(ctx.stack().frame_count(), 0);
}

// ===== Backtraces =====

#[test]
fn test_backtrace_crosses_sessions() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("trace.st");
    let bt = unit.intern("debug_backtrace");
    let mut w = BytecodeWriter::new();
    w.emit_push_func(bt);
    w.emit_call(0);
    unit.add_function(Function::new("inner", 0, ret(w)));
    forwarder(&mut unit, "outer", "call_user_func", "inner");
    load(&mut ctx, unit);

    let frames = elements(&call(&mut ctx, "outer", &[]).unwrap());
    let names: Vec<String> = frames
        .iter()
        .map(|f| {
            f.as_array()
                .and_then(|a| a.borrow().get_str("function").cloned())
                .map(|v| v.to_display_string())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(names, vec!["inner", "outer"]);
}

// ===== Limits =====

#[test]
fn test_nesting_limit_is_fatal_and_unwinds() {
    let (mut ctx, _) = context_with(VmOptions {
        limits: ResourceLimits {
            max_nesting_depth: 3,
            ..ResourceLimits::default()
        },
        ..VmOptions::default()
    });
    let mut unit = Unit::new("rec.st");
    forwarder(&mut unit, "rec", "call_user_func", "rec");
    load(&mut ctx, unit);

    let err = call(&mut ctx, "rec", &[]).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow));
    assert_eq!(ctx.stats().max_nesting, 3);
    assert_eq!(ctx.nesting_level(), 0);
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
    assert!(ctx.fp().is_none());
}
