//! Activation records and the invocation protocol
//!
//! These tests verify:
//! - Guest-to-guest calls and returns through the pre-live frame protocol
//! - Parameter binding, defaults and missing arguments
//! - Variadic parameters, the extra-args table and the excess-args policy
//! - Variable environments for pseudo-mains
//! - Frame variable access from natives and the exit callback
//! - Stack teardown after failures

mod common;

use common::*;
use strata_bytecode::{
    attrs, BytecodeWriter, ClassDef, Constant, Function, Opcode, Param, PropDef, Unit, Visibility,
};
use strata_vm::{
    ExcessArgsPolicy, ExecutionContext, InvokeFlags, ObjectRef, RequestOutcome, ResourceLimits,
    Value, VmError, VmOptions, VmResult,
};

fn add_function(unit: &mut Unit) {
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    w.emit_get_local(1);
    w.emit_opcode(Opcode::Add);
    unit.add_function(
        Function::new("add", 2, ret(w))
            .with_params(vec![Param::required("a"), Param::optional("b", Constant::Int(10))]),
    );
}

fn fact_function(unit: &mut Unit) {
    // if (n <= 1) return 1; return n * fact(n - 1);
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
}

// ===== Calls and returns =====

#[test]
fn test_native_to_guest_call() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("calls.st");
    add_function(&mut unit);
    load(&mut ctx, unit);

    let result = call(&mut ctx, "add", &[Value::Int(2), Value::Int(3)]).unwrap();
    assert_eq!(result, Value::Int(5));
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
    assert!(ctx.fp().is_none());
}

#[test]
fn test_recursive_guest_calls() {
    let (mut ctx, out) = context();
    let mut unit = Unit::new("fact.st");
    fact_function(&mut unit);
    let fact = unit.intern("fact");
    let mut w = BytecodeWriter::new();
    w.emit_push_func(fact);
    w.emit_int(5);
    w.emit_call(1);
    w.emit_opcode(Opcode::Print);
    w.emit_null();
    set_main(&mut unit, 0, ret(w));
    let id = load(&mut ctx, unit);

    match ctx.run_request(id) {
        RequestOutcome::Completed(Value::Null) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(out.contents(), "120");
    assert_eq!(ctx.stats().calls, 6);
}

#[test]
fn test_operands_below_call_survive() {
    // 100 + add(1, 2)
    let (mut ctx, _) = context();
    let mut unit = Unit::new("operands.st");
    add_function(&mut unit);
    let add = unit.intern("add");
    let mut w = BytecodeWriter::new();
    w.emit_int(100);
    w.emit_push_func(add);
    w.emit_int(1);
    w.emit_int(2);
    w.emit_call(2);
    w.emit_opcode(Opcode::Add);
    unit.add_function(Function::new("outer", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "outer", &[]).unwrap(), Value::Int(103));
}

#[test]
fn test_undefined_function_is_reported() {
    let (mut ctx, _) = context();
    let err = call(&mut ctx, "missing", &[]).unwrap_err();
    assert!(matches!(err, VmError::FunctionNotFound(ref name) if name == "missing"));
}

/// `[$this, local count, sp, base, frame index]` of the calling guest frame
fn frame_shape(ctx: &mut ExecutionContext, _: Option<&ObjectRef>, _: &[Value]) -> VmResult<Value> {
    let fp = ctx
        .fp()
        .ok_or_else(|| VmError::RuntimeError("no calling frame".into()))?;
    let ar = ctx.stack().frame(fp)?;
    let this = ar.subject.this().cloned().map_or(Value::Null, Value::Object);
    Ok(Value::list(vec![
        this,
        Value::Int(ar.local_count() as i64),
        Value::Int(ctx.stack().sp() as i64),
        Value::Int(ar.base as i64),
        Value::Int(fp.index() as i64),
    ]))
}

/// `class Holder { public $n; function work() { ... } function grow($k) { ... } }`
fn holder_unit() -> Unit {
    let mut unit = Unit::new("holder.st");
    let n = unit.intern("n");
    let grow = unit.intern("grow");
    let shape = unit.intern("frame_shape");
    let mut class = ClassDef::new("Holder", None);
    class.props.push(PropDef {
        name: "n".into(),
        default: Constant::Null,
    });

    // $this->n = $k; $t = $k * 2; return $t;
    let mut w = BytecodeWriter::new();
    w.emit_this();
    w.emit_get_local(0);
    w.emit_set_prop(n);
    w.emit_get_local(0);
    w.emit_int(2);
    w.emit_opcode(Opcode::Mul);
    w.emit_set_local(1);
    w.emit_get_local(1);
    let grow_fn = Function::new("grow", 3, ret(w)).with_params(vec![Param::required("k")]);
    unit.add_method(&mut class, grow_fn, Visibility::Public, false);

    // $a = frame_shape(); $this->grow(4); $b = frame_shape(); return [$a, $b];
    let mut w = BytecodeWriter::new();
    w.emit_push_func(shape);
    w.emit_call(0);
    w.emit_set_local(0);
    w.emit_this();
    w.emit_push_obj_method(grow);
    w.emit_int(4);
    w.emit_call(1);
    w.emit_pop();
    w.emit_push_func(shape);
    w.emit_call(0);
    w.emit_set_local(1);
    w.emit_new_array();
    w.emit_get_local(0);
    w.emit_add_elem();
    w.emit_get_local(1);
    w.emit_add_elem();
    unit.add_method(&mut class, Function::new("work", 2, ret(w)), Visibility::Public, false);

    unit.classes.push(class);
    unit
}

#[test]
fn test_method_frame_survives_nested_call() {
    let (mut ctx, _) = context();
    ctx.register_native("frame_shape", frame_shape);
    load(&mut ctx, holder_unit());
    let obj = ctx.create_object("Holder", &[]).unwrap();
    let call_ctx = ctx
        .resolve_callable(&Value::list(vec![Value::Object(obj.clone()), Value::str("work")]))
        .unwrap();

    let result = ctx
        .invoke_func(&call_ctx, &[], None, InvokeFlags::Normal)
        .unwrap();
    let shapes = elements(&result);
    let (before, after) = (elements(&shapes[0]), elements(&shapes[1]));
    assert_eq!(before, after);
    assert_eq!(before[0], Value::Object(obj.clone()));
    assert_eq!(before[1], Value::Int(2));
    assert_eq!(before[2], Value::Int(2));
    assert_eq!(before[3], Value::Int(0));

    assert_eq!(obj.borrow().get_prop("n"), Some(Value::Int(4)));
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
}

// ===== Parameters =====

#[test]
fn test_default_parameter_fills_missing_argument() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("defaults.st");
    add_function(&mut unit);
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "add", &[Value::Int(1)]).unwrap(), Value::Int(11));
}

#[test]
fn test_missing_required_argument_is_fatal() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("defaults.st");
    add_function(&mut unit);
    load(&mut ctx, unit);

    let err = call(&mut ctx, "add", &[]).unwrap_err();
    match err {
        VmError::TooFewArguments {
            function,
            passed,
            required,
        } => {
            assert_eq!(function, "add");
            assert_eq!(passed, 0);
            assert_eq!(required, 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
}

#[test]
fn test_variadic_collects_rest() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("variadic.st");
    let mut w = BytecodeWriter::new();
    w.emit_get_local(1);
    unit.add_function(
        Function::new("rest", 2, ret(w))
            .with_params(vec![Param::required("first"), Param::variadic("others")]),
    );
    load(&mut ctx, unit);

    let all = call(&mut ctx, "rest", &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
    assert_eq!(elements(&all), vec![Value::Int(2), Value::Int(3)]);

    let none = call(&mut ctx, "rest", &[Value::Int(1)]).unwrap();
    assert!(none.as_array().is_some());
    assert!(elements(&none).is_empty());
}

#[test]
fn test_extra_args_reach_func_get_args() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("extra.st");
    let get_args = unit.intern("func_get_args");
    let mut w = BytecodeWriter::new();
    w.emit_push_func(get_args);
    w.emit_call(0);
    unit.add_function(
        Function::new("collect", 1, ret(w))
            .with_params(vec![Param::required("a")])
            .with_attrs(attrs::ACCEPTS_EXTRA_ARGS),
    );
    load(&mut ctx, unit);

    let args = call(&mut ctx, "collect", &[Value::Int(1), Value::str("x"), Value::Int(3)]).unwrap();
    assert_eq!(elements(&args), vec![Value::Int(1), Value::str("x"), Value::Int(3)]);
}

#[test]
fn test_excess_args_warn_and_drop() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("excess.st");
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    unit.add_function(Function::new("one", 1, ret(w)).with_params(vec![Param::required("a")]));
    load(&mut ctx, unit);

    let result = call(&mut ctx, "one", &[Value::Int(7), Value::Int(8)]).unwrap();
    assert_eq!(result, Value::Int(7));
    let last = ctx.last_error().expect("warning recorded");
    assert_eq!(last.message, "one() expects at most 1 arguments, 2 given");
}

#[test]
fn test_excess_args_error_policy() {
    let (mut ctx, _) = context_with(VmOptions {
        excess_args: ExcessArgsPolicy::Error,
        ..VmOptions::default()
    });
    let mut unit = Unit::new("excess.st");
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    unit.add_function(Function::new("one", 1, ret(w)).with_params(vec![Param::required("a")]));
    load(&mut ctx, unit);

    let err = call(&mut ctx, "one", &[Value::Int(7), Value::Int(8)]).unwrap_err();
    assert!(matches!(
        err,
        VmError::TooManyArguments {
            passed: 2,
            declared: 1,
            ..
        }
    ));
}

// ===== Variable environments =====

#[test]
fn test_pseudo_main_shares_globals() {
    let (mut ctx, out) = context();

    // $x = 41 + 1;
    let mut first = Unit::new("first.st");
    let mut w = BytecodeWriter::new();
    w.emit_int(41);
    w.emit_int(1);
    w.emit_opcode(Opcode::Add);
    w.emit_set_local(0);
    w.emit_null();
    set_main(&mut first, 1, ret(w));
    first.functions[0].local_names = vec!["x".to_string()];
    let first = load(&mut ctx, first);

    // echo $x;
    let mut second = Unit::new("second.st");
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    w.emit_opcode(Opcode::Print);
    w.emit_null();
    set_main(&mut second, 1, ret(w));
    second.functions[0].local_names = vec!["x".to_string()];
    let second = load(&mut ctx, second);

    ctx.invoke_unit(first).unwrap();
    assert_eq!(ctx.globals().borrow().get("x"), Some(&Value::Int(42)));
    ctx.invoke_unit(second).unwrap();
    assert_eq!(out.contents(), "42");
}

fn inject(ctx: &mut ExecutionContext, _this: Option<&ObjectRef>, args: &[Value]) -> VmResult<Value> {
    ctx.set_var("copied", args[0].clone())?;
    ctx.bind_var("bound", args[0].clone())?;
    ctx.set_var("extra", Value::Int(9))?;
    Ok(Value::Null)
}

/// `function vars($a) { $b = "two"; return get_defined_vars(); }` with one
/// unnamed temporary
fn vars_function(unit: &mut Unit) {
    let two = unit.intern("two");
    let gdv = unit.intern("get_defined_vars");
    let mut w = BytecodeWriter::new();
    w.emit_string(two);
    w.emit_set_local(1);
    w.emit_push_func(gdv);
    w.emit_call(0);
    let mut f = Function::new("vars", 3, ret(w)).with_params(vec![Param::required("a")]);
    f.local_names = vec!["a".to_string(), "b".to_string()];
    unit.add_function(f);
}

#[test]
fn test_get_defined_vars_lists_named_locals() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("vars.st");
    vars_function(&mut unit);
    load(&mut ctx, unit);

    let vars = call(&mut ctx, "vars", &[Value::Int(1)]).unwrap();
    let vars = vars.as_array().expect("array").borrow().clone();
    assert_eq!(vars.len(), 2);
    assert_eq!(vars.get_str("a"), Some(&Value::Int(1)));
    assert_eq!(vars.get_str("b"), Some(&Value::str("two")));

    ctx.globals().borrow_mut().insert("g".into(), Value::Int(3));
    let globals = ctx.get_local_defined_variables().unwrap();
    assert_eq!(globals.len(), 1);
    assert_eq!(globals.get_str("g"), Some(&Value::Int(3)));
}

#[test]
fn test_native_sets_and_binds_caller_variables() {
    let (mut ctx, _) = context();
    ctx.register_native("inject", inject);
    let mut unit = Unit::new("inject.st");
    let inject_name = unit.intern("inject");
    let gdv = unit.intern("get_defined_vars");

    // inject($xs); return [$copied, $bound, get_defined_vars()];
    let mut w = BytecodeWriter::new();
    w.emit_push_func(inject_name);
    w.emit_get_local(0);
    w.emit_call(1);
    w.emit_pop();
    w.emit_new_array();
    w.emit_get_local(1);
    w.emit_add_elem();
    w.emit_get_local(2);
    w.emit_add_elem();
    w.emit_push_func(gdv);
    w.emit_call(0);
    w.emit_add_elem();
    let mut f = Function::new("receive", 3, ret(w)).with_params(vec![Param::required("xs")]);
    f.local_names = vec!["xs".to_string(), "copied".to_string(), "bound".to_string()];
    unit.add_function(f);
    load(&mut ctx, unit);

    let xs = Value::list(vec![Value::Int(1), Value::Int(2)]);
    let result = elements(&call(&mut ctx, "receive", &[xs.clone()]).unwrap());
    let shared = xs.as_array().expect("array");
    let copied = result[0].as_array().expect("copied array");
    let bound = result[1].as_array().expect("bound array");
    assert!(!std::rc::Rc::ptr_eq(copied, shared));
    assert_eq!(elements(&result[0]), vec![Value::Int(1), Value::Int(2)]);
    assert!(std::rc::Rc::ptr_eq(bound, shared));

    let vars = result[2].as_array().expect("vars").borrow().clone();
    assert_eq!(vars.len(), 4);
    assert_eq!(vars.get_index(3).map(|(k, _)| k.to_value()), Some(Value::str("extra")));
    assert_eq!(vars.get_str("extra"), Some(&Value::Int(9)));
    assert_eq!(ctx.stack().frame_count(), 0);
}

#[test]
fn test_set_var_without_frame_writes_globals() {
    let (mut ctx, _) = context();
    ctx.set_var("answer", Value::Int(42)).unwrap();
    assert_eq!(ctx.globals().borrow().get("answer"), Some(&Value::Int(42)));
}

#[test]
fn test_exit_callback_runs_once_on_request_exit() {
    let (mut ctx, out) = context();
    let mut unit = Unit::new("exit.st");
    let bye = unit.intern("bye");
    let mut w = BytecodeWriter::new();
    w.emit_string(bye);
    w.emit_opcode(Opcode::Print);
    w.emit_null();
    unit.add_function(Function::new("bye", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(ctx.set_exit_callback(Value::str("nope")), None);
    assert_eq!(ctx.set_exit_callback(Value::str("bye")), Some(Value::str("nope")));
    ctx.globals().borrow_mut().insert("g".into(), Value::Int(1));

    ctx.request_exit();
    assert_eq!(out.contents(), "bye");
    assert!(ctx.globals().borrow().is_empty());
    assert_eq!(ctx.stack().frame_count(), 0);

    ctx.request_exit();
    assert_eq!(out.contents(), "bye");
}

// ===== Limits =====

#[test]
fn test_runaway_recursion_overflows_cleanly() {
    let (mut ctx, _) = context_with(VmOptions {
        limits: ResourceLimits {
            max_stack_slots: 512,
            ..ResourceLimits::default()
        },
        ..VmOptions::default()
    });
    let mut unit = Unit::new("deep.st");
    let deep = unit.intern("deep");
    let mut w = BytecodeWriter::new();
    w.emit_push_func(deep);
    w.emit_call(0);
    unit.add_function(Function::new("deep", 1, ret(w)));
    load(&mut ctx, unit);

    let err = call(&mut ctx, "deep", &[]).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow));
    assert_eq!(ctx.stack().sp(), 0);
    assert_eq!(ctx.stack().frame_count(), 0);
}
