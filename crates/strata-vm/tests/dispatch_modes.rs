//! Dispatch modes and surprise checks
//!
//! These tests verify:
//! - Basic-block stepping produces the same result as continuous dispatch
//! - An observer can abort a stepped invocation cleanly
//! - Surprise conditions raised by other threads or natives are serviced at
//!   function entry and backward jumps
//! - Wall-clock deadlines and the code-cache invalidation signal

mod common;

use common::*;
use std::cell::RefCell;
use std::rc::Rc;
use strata_bytecode::{BytecodeWriter, Function, Opcode, Param, Unit};
use strata_vm::{
    CodeCache, ExecutionContext, Func, ObjectRef, ResourceLimits, Value, VmError, VmOptions,
    VmResult,
};

/// `function fact($n) { return $n <= 1 ? 1 : $n * fact($n - 1); }`
fn fact_unit() -> Unit {
    let mut unit = Unit::new("fact.st");
    let fact = unit.intern("fact");
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    w.emit_int(1);
    w.emit_opcode(Opcode::Lte);
    let recurse = w.emit_jump_forward(Opcode::JmpZ);
    w.emit_int(1);
    w.emit_opcode(Opcode::RetC);
    w.bind(recurse);
    w.emit_get_local(0);
    w.emit_push_func(fact);
    w.emit_get_local(0);
    w.emit_int(1);
    w.emit_opcode(Opcode::Sub);
    w.emit_call(1);
    w.emit_opcode(Opcode::Mul);
    unit.add_function(Function::new("fact", 1, ret(w)).with_params(vec![Param::required("n")]));
    unit
}

/// `function spin() { while (true) { tick(); } }`
fn spin_body(unit: &mut Unit) -> BytecodeWriter {
    let tick = unit.intern("tick");
    let mut w = BytecodeWriter::new();
    let top = w.offset();
    w.emit_push_func(tick);
    w.emit_call(0);
    w.emit_pop();
    w.emit_jump(Opcode::Jmp, top);
    w
}

fn noop(_: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    Ok(Value::Null)
}

fn request_stop(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    ctx.surprise_flags().request_exception("stop");
    Ok(Value::Null)
}

fn request_timeout(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    ctx.surprise_flags().request_timeout();
    Ok(Value::Null)
}

fn request_interrupt(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    ctx.surprise_flags().request_interrupt();
    Ok(Value::Null)
}

// ===== Basic-block dispatch =====

#[test]
fn test_stepped_matches_continuous() {
    let (mut ctx, _) = context();
    load(&mut ctx, fact_unit());
    let call_ctx = ctx.resolve_callable(&Value::str("fact")).unwrap();

    let mut steps = 0;
    let stepped = ctx
        .invoke_func_stepped(&call_ctx, &[Value::Int(5)], |ctx| {
            steps += 1;
            // Between blocks the session is live and the cursor sits inside
            // the current frame.
            let fp = ctx.fp().expect("live frame");
            let ar = ctx.stack().frame(fp)?;
            assert!(ctx.stack().sp() >= ar.locals_end());
            Ok(())
        })
        .unwrap();
    assert_eq!(stepped, Value::Int(120));
    assert!(steps > 5);

    let continuous = call(&mut ctx, "fact", &[Value::Int(5)]).unwrap();
    assert_eq!(stepped, continuous);
    assert_eq!(ctx.stack().sp(), 0);
}

#[test]
fn test_observer_error_aborts_stepping() {
    let (mut ctx, _) = context();
    load(&mut ctx, fact_unit());
    let call_ctx = ctx.resolve_callable(&Value::str("fact")).unwrap();

    let mut steps = 0;
    let err = ctx
        .invoke_func_stepped(&call_ctx, &[Value::Int(10)], |_| {
            steps += 1;
            if steps == 3 {
                return Err(VmError::Fatal("observer stop".into()));
            }
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, VmError::Fatal(ref m) if m == "observer stop"));
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
    assert!(ctx.fp().is_none());
}

// ===== Surprise checks =====

#[test]
fn test_pending_exception_interrupts_loop() {
    let (mut ctx, _) = context();
    ctx.register_native("tick", request_stop);
    let mut unit = Unit::new("spin.st");
    let get_message = unit.intern("getMessage");
    // try { while (true) { tick(); } } catch ($e) { return $e->getMessage(); }
    let mut w = spin_body(&mut unit);
    let handler = w.offset();
    w.emit_push_obj_method(get_message);
    w.emit_call(0);
    let mut f = Function::new("spin", 0, ret(w));
    f.handlers.push(region(0, handler, handler));
    unit.add_function(f);
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "spin", &[]).unwrap(), Value::str("stop"));
    assert!(!ctx.surprise_flags().is_pending());
}

#[test]
fn test_timeout_request_is_fatal() {
    let (mut ctx, _) = context();
    ctx.register_native("tick", request_timeout);
    let mut unit = Unit::new("spin.st");
    let w = spin_body(&mut unit);
    unit.add_function(Function::new("spin", 0, w.into_bytes()));
    load(&mut ctx, unit);

    let err = call(&mut ctx, "spin", &[]).unwrap_err();
    assert!(matches!(err, VmError::Timeout));
    assert_eq!(ctx.stack().frame_count(), 0);
}

#[test]
fn test_flag_raised_from_another_thread() {
    let (mut ctx, _) = context();
    load(&mut ctx, fact_unit());
    let flags = ctx.surprise_flags();
    std::thread::spawn(move || flags.request_timeout())
        .join()
        .unwrap();

    // Serviced at the entry check of the first call.
    assert!(matches!(call(&mut ctx, "fact", &[Value::Int(3)]), Err(VmError::Timeout)));
    assert_eq!(call(&mut ctx, "fact", &[Value::Int(3)]).unwrap(), Value::Int(6));
}

#[test]
fn test_deadline_stops_runaway_loop() {
    let (mut ctx, _) = context_with(VmOptions {
        limits: ResourceLimits::with_time_limit(1),
        surprise_poll_interval: 1,
        ..VmOptions::default()
    });
    ctx.register_native("tick", noop);
    let mut unit = Unit::new("spin.st");
    let w = spin_body(&mut unit);
    unit.add_function(Function::new("spin", 0, w.into_bytes()));
    load(&mut ctx, unit);

    assert!(matches!(call(&mut ctx, "spin", &[]), Err(VmError::Timeout)));
}

#[test]
fn test_interrupt_hook_sees_interrupted_frame() {
    let (mut ctx, _) = context();
    ctx.register_native("poke", request_interrupt);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    ctx.set_interrupt_hook(Rc::new(move |ctx: &ExecutionContext| {
        let names = ctx.backtrace(false).iter().map(|f| f.function.to_string()).collect::<Vec<_>>();
        log.borrow_mut().push(names);
    }));

    let mut unit = Unit::new("hook.st");
    let poke = unit.intern("poke");
    let callee = unit.intern("callee");
    let mut w = BytecodeWriter::new();
    w.emit_int(7);
    unit.add_function(Function::new("callee", 0, ret(w)));
    // function caller() { poke(); return callee(); }
    let mut w = BytecodeWriter::new();
    w.emit_push_func(poke);
    w.emit_call(0);
    w.emit_pop();
    w.emit_push_func(callee);
    w.emit_call(0);
    unit.add_function(Function::new("caller", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "caller", &[]).unwrap(), Value::Int(7));
    assert_eq!(*seen.borrow(), vec![vec!["caller".to_string()]]);
}

// ===== Code cache =====

struct StaleFact;

impl CodeCache for StaleFact {
    fn is_invalidated(&self, func: &Func) -> bool {
        &*func.name == "fact"
    }
}

#[test]
fn test_invalidated_entries_are_counted() {
    let (mut ctx, _) = context();
    load(&mut ctx, fact_unit());
    ctx.set_code_cache(Rc::new(StaleFact));

    assert_eq!(call(&mut ctx, "fact", &[Value::Int(4)]).unwrap(), Value::Int(24));
    assert_eq!(ctx.stats().invalidated_entries, 4);
}
