//! Async functions and wait handles
//!
//! These tests verify:
//! - Eager execution until the first await on an unfinished handle
//! - Suspension into a blocked wait handle and resumption by a host scheduler
//! - Repeated suspension of an already-resumed frame
//! - Failure propagation into wait handles

mod common;

use common::*;
use strata_bytecode::{attrs, BytecodeWriter, Function, Opcode, Param, Unit};
use strata_vm::{
    ExecutionContext, ObjectRef, ResourceLimits, Value, VmError, VmOptions, VmResult,
    WaitHandleState,
};

fn async_fn(name: &str, params: &[&str], local_count: u16, w: BytecodeWriter) -> Function {
    Function::new(name, local_count, ret(w))
        .with_params(params.iter().map(|p| Param::required(*p)).collect())
        .with_attrs(attrs::ASYNC)
}

fn handle(value: &Value) -> ObjectRef {
    value.as_object().cloned().expect("wait handle")
}

fn succeeded(ctx: &ExecutionContext, h: &ObjectRef) -> Option<Value> {
    match ctx.wait_handle_state(h).unwrap() {
        WaitHandleState::Succeeded(v) => Some(v),
        _ => None,
    }
}

/// `async function plus_one($h) { $v = await $h; return $v + 1; }`
fn plus_one(unit: &mut Unit) {
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    w.emit_opcode(Opcode::Await);
    w.emit_int(1);
    w.emit_opcode(Opcode::Add);
    unit.add_function(async_fn("plus_one", &["h"], 1, w));
}

// ===== Eager completion =====

#[test]
fn test_eager_completion_returns_finished_handle() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    let mut w = BytecodeWriter::new();
    w.emit_int(5);
    unit.add_function(async_fn("five", &[], 0, w));
    load(&mut ctx, unit);

    let h = handle(&call(&mut ctx, "five", &[]).unwrap());
    assert_eq!(&*h.borrow().class.name, "WaitHandle");
    assert_eq!(succeeded(&ctx, &h), Some(Value::Int(5)));
    assert_eq!(ctx.stats().suspensions, 0);
}

#[test]
fn test_awaiting_finished_handle_continues() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    plus_one(&mut unit);
    load(&mut ctx, unit);

    let done = ctx.create_pending_wait_handle().unwrap();
    ctx.succeed_wait_handle(&done, Value::Int(41)).unwrap();
    let h = handle(&call(&mut ctx, "plus_one", &[Value::Object(done)]).unwrap());
    assert_eq!(succeeded(&ctx, &h), Some(Value::Int(42)));
}

#[test]
fn test_eager_failure_fails_handle() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    let exception = unit.intern("Exception");
    let boom = unit.intern("boom");
    let mut w = BytecodeWriter::new();
    emit_throw_new(&mut w, exception, boom);
    unit.add_function(
        Function::new("fails", 0, w.into_bytes()).with_attrs(attrs::ASYNC),
    );
    load(&mut ctx, unit);

    let h = handle(&call(&mut ctx, "fails", &[]).unwrap());
    let callable = Value::list(vec![Value::Object(h.clone()), Value::str("isFailed")]);
    assert_eq!(ctx.call_user_func(&callable, &[]).unwrap(), Value::Bool(true));
    let err = ctx.wait_handle_result(&h).unwrap_err();
    assert_eq!(thrown(&err).map(|(_, m)| m), Some("boom".to_string()));
}

// ===== Suspension =====

#[test]
fn test_pending_await_suspends_until_resumed() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    plus_one(&mut unit);
    load(&mut ctx, unit);

    let pending = ctx.create_pending_wait_handle().unwrap();
    let h = handle(&call(&mut ctx, "plus_one", &[Value::Object(pending.clone())]).unwrap());
    assert!(matches!(
        ctx.wait_handle_state(&h).unwrap(),
        WaitHandleState::Blocked { .. }
    ));
    assert!(ctx.blocked_on(&h).is_some_and(|child| std::rc::Rc::ptr_eq(&child, &pending)));
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);

    ctx.succeed_wait_handle(&pending, Value::Int(9)).unwrap();
    let result = ctx.wait_handle_result(&pending).unwrap();
    ctx.resume_async_func(&h, result).unwrap();
    assert_eq!(succeeded(&ctx, &h), Some(Value::Int(10)));
    assert_eq!(ctx.stats().resumptions, 1);

    // A finished handle cannot be resumed again.
    assert!(matches!(
        ctx.resume_async_func(&h, Value::Null),
        Err(VmError::InvalidResume(_))
    ));
}

#[test]
fn test_resumed_frame_suspends_again() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    // async function sum($a, $b) { $x = await $a; $y = await $b; return $x + $y; }
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    w.emit_opcode(Opcode::Await);
    w.emit_set_local(2);
    w.emit_get_local(1);
    w.emit_opcode(Opcode::Await);
    w.emit_set_local(3);
    w.emit_get_local(2);
    w.emit_get_local(3);
    w.emit_opcode(Opcode::Add);
    unit.add_function(async_fn("sum", &["a", "b"], 4, w));
    load(&mut ctx, unit);

    let a = ctx.create_pending_wait_handle().unwrap();
    let b = ctx.create_pending_wait_handle().unwrap();
    let h = handle(&call(&mut ctx, "sum", &[Value::Object(a.clone()), Value::Object(b.clone())]).unwrap());

    ctx.resume_async_func(&h, Value::Int(1)).unwrap();
    assert!(ctx.blocked_on(&h).is_some_and(|child| std::rc::Rc::ptr_eq(&child, &b)));
    ctx.resume_async_func(&h, Value::Int(2)).unwrap();
    assert_eq!(succeeded(&ctx, &h), Some(Value::Int(3)));
    assert_eq!(ctx.stats().suspensions, 2);
}

#[test]
fn test_scheduler_drives_await_chain() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    plus_one(&mut unit);
    let plus_one = unit.intern("plus_one");
    // async function outer($h) { return await plus_one($h); }
    let mut w = BytecodeWriter::new();
    w.emit_push_func(plus_one);
    w.emit_get_local(0);
    w.emit_call(1);
    w.emit_opcode(Opcode::Await);
    unit.add_function(async_fn("outer", &["h"], 1, w));
    load(&mut ctx, unit);

    let leaf = ctx.create_pending_wait_handle().unwrap();
    let root = handle(&call(&mut ctx, "outer", &[Value::Object(leaf.clone())]).unwrap());
    ctx.succeed_wait_handle(&leaf, Value::Int(1)).unwrap();

    // Resume the deepest blocked handle whose child has finished.
    while succeeded(&ctx, &root).is_none() {
        let mut current = root.clone();
        while let Some(child) = ctx.blocked_on(&current) {
            if ctx.blocked_on(&child).is_none() {
                break;
            }
            current = child;
        }
        let child = ctx.blocked_on(&current).expect("blocked handle");
        let value = ctx.wait_handle_result(&child).unwrap();
        ctx.resume_async_func(&current, value).unwrap();
    }
    assert_eq!(succeeded(&ctx, &root), Some(Value::Int(2)));
}

fn resume_with_one(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, args: &[Value]) -> VmResult<Value> {
    let h = args.first().and_then(Value::as_object).cloned().expect("wait handle");
    ctx.resume_async_func(&h, Value::Int(1))?;
    Ok(Value::Null)
}

#[test]
fn test_refused_resume_keeps_handle_blocked() {
    let (mut ctx, _) = context_with(VmOptions {
        limits: ResourceLimits {
            max_nesting_depth: 0,
            ..ResourceLimits::default()
        },
        ..VmOptions::default()
    });
    ctx.register_native("resume_with_one", resume_with_one);
    let mut unit = Unit::new("async.st");
    plus_one(&mut unit);
    let resume = unit.intern("resume_with_one");
    // function kick($h) { return resume_with_one($h); }
    let mut w = BytecodeWriter::new();
    w.emit_push_func(resume);
    w.emit_get_local(0);
    w.emit_call(1);
    unit.add_function(Function::new("kick", 1, ret(w)).with_params(vec![Param::required("h")]));
    load(&mut ctx, unit);

    let pending = ctx.create_pending_wait_handle().unwrap();
    let h = handle(&call(&mut ctx, "plus_one", &[Value::Object(pending.clone())]).unwrap());

    // Resuming from inside guest code needs a nested session.
    let err = call(&mut ctx, "kick", &[Value::Object(h.clone())]).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow));
    assert!(ctx.blocked_on(&h).is_some_and(|child| std::rc::Rc::ptr_eq(&child, &pending)));
    assert_eq!(ctx.stats().resumptions, 0);

    ctx.resume_async_func(&h, Value::Int(1)).unwrap();
    assert_eq!(succeeded(&ctx, &h), Some(Value::Int(2)));
}

// ===== Failure =====

#[test]
fn test_throw_into_suspended_frame_fails_handle() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    plus_one(&mut unit);
    load(&mut ctx, unit);

    let pending = ctx.create_pending_wait_handle().unwrap();
    let h = handle(&call(&mut ctx, "plus_one", &[Value::Object(pending)]).unwrap());
    let exc = ctx.create_exception("Exception", "cancelled").unwrap();
    ctx.resume_async_func_throw(&h, exc).unwrap();

    assert!(matches!(ctx.wait_handle_state(&h).unwrap(), WaitHandleState::Failed(_)));
    let err = ctx.wait_handle_result(&h).unwrap_err();
    assert_eq!(thrown(&err).map(|(_, m)| m), Some("cancelled".to_string()));
    assert_eq!(ctx.nesting_level(), 0);
}

#[test]
fn test_await_outside_async_function_throws() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("async.st");
    let mut w = BytecodeWriter::new();
    w.emit_null();
    w.emit_opcode(Opcode::Await);
    unit.add_function(Function::new("sync", 0, ret(w)));
    load(&mut ctx, unit);

    let err = call(&mut ctx, "sync", &[]).unwrap_err();
    let (class, message) = thrown(&err).expect("guest exception");
    assert_eq!(class, "ErrorException");
    assert!(message.contains("Cannot await in non-async function sync"));
}
