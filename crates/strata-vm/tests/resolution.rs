//! Method, constructor and class-constant resolution
//!
//! These tests verify:
//! - Instance and static dispatch, with and without `$this`
//! - Constructors, default constructors and property access
//! - `__call` / `__callStatic` fallbacks and their argument shuffling
//! - Visibility checks against the calling context
//! - Inherited constants and `instanceof`

mod common;

use common::*;
use strata_bytecode::{
    BytecodeWriter, ClassDef, ConstDef, Constant, Function, Opcode, Param, PropDef, Unit,
    Visibility,
};
use strata_vm::{Value, VmError};

/// `class Counter { public $count = 0; function bump($n) { ... } static function make() }`
fn counter_unit() -> Unit {
    let mut unit = Unit::new("counter.st");
    let count = unit.intern("count");
    let counter = unit.intern("Counter");
    let mut class = ClassDef::new("Counter", None);
    class.props.push(PropDef {
        name: "count".into(),
        default: Constant::Int(0),
    });

    // $this->count = $this->count + $n; return $this->count;
    let mut w = BytecodeWriter::new();
    w.emit_this();
    w.emit_this();
    w.emit_get_prop(count);
    w.emit_get_local(0);
    w.emit_opcode(Opcode::Add);
    w.emit_set_prop(count);
    w.emit_this();
    w.emit_get_prop(count);
    let bump = Function::new("bump", 1, ret(w)).with_params(vec![Param::required("n")]);
    unit.add_method(&mut class, bump, Visibility::Public, false);

    // return new Counter();
    let mut w = BytecodeWriter::new();
    w.emit_push_ctor(counter);
    w.emit_call(0);
    unit.add_method(&mut class, Function::new("make", 0, ret(w)), Visibility::Public, true);

    unit.classes.push(class);
    unit
}

// ===== Instance and static methods =====

#[test]
fn test_object_method_binds_this() {
    let (mut ctx, _) = context();
    let mut unit = counter_unit();
    let counter = unit.intern("Counter");
    let bump = unit.intern("bump");

    // $c = new Counter(); $c->bump(5); return $c->bump(5);
    let mut w = BytecodeWriter::new();
    w.emit_push_ctor(counter);
    w.emit_call(0);
    w.emit_set_local(0);
    for _ in 0..2 {
        w.emit_get_local(0);
        w.emit_push_obj_method(bump);
        w.emit_int(5);
        w.emit_call(1);
    }
    w.emit_opcode(Opcode::Add);
    unit.add_function(Function::new("run", 1, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "run", &[]).unwrap(), Value::Int(15));
}

#[test]
fn test_static_method_from_native() {
    let (mut ctx, _) = context();
    load(&mut ctx, counter_unit());

    let made = ctx.call_user_func(&Value::str("Counter::make"), &[]).unwrap();
    let obj = made.as_object().expect("object");
    assert_eq!(&*obj.borrow().class.name, "Counter");
    assert_eq!(obj.borrow().get_prop("count"), Some(Value::Int(0)));
}

#[test]
fn test_instance_method_called_statically_throws() {
    let (mut ctx, _) = context();
    let mut unit = counter_unit();
    let counter = unit.intern("Counter");
    let bump = unit.intern("bump");
    let mut w = BytecodeWriter::new();
    w.emit_push_cls_method(counter, bump);
    w.emit_int(1);
    w.emit_call(1);
    unit.add_function(Function::new("run", 0, ret(w)));
    load(&mut ctx, unit);

    let err = call(&mut ctx, "run", &[]).unwrap_err();
    let (class, message) = thrown(&err).expect("guest exception");
    assert_eq!(class, "ErrorException");
    assert!(message.contains("Non-static method Counter::bump() cannot be called statically"));
}

#[test]
fn test_missing_method_is_fatal() {
    let (mut ctx, _) = context();
    load(&mut ctx, counter_unit());
    let obj = ctx.create_object("Counter", &[]).unwrap();

    let callable = Value::list(vec![Value::Object(obj), Value::str("nope")]);
    let err = ctx.call_user_func(&callable, &[]).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.to_string(), "Call to undefined method Counter::nope()");
}

// ===== Constructors and properties =====

#[test]
fn test_constructor_receives_arguments() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("point.st");
    let x = unit.intern("x");
    let point = unit.intern("Point");
    let mut class = ClassDef::new("Point", None);
    class.props.push(PropDef {
        name: "x".into(),
        default: Constant::Null,
    });
    let mut w = BytecodeWriter::new();
    w.emit_this();
    w.emit_get_local(0);
    w.emit_set_prop(x);
    w.emit_null();
    let ctor = Function::new("__construct", 1, ret(w)).with_params(vec![Param::required("x")]);
    unit.add_method(&mut class, ctor, Visibility::Public, false);
    unit.classes.push(class);

    let mut w = BytecodeWriter::new();
    w.emit_push_ctor(point);
    w.emit_int(3);
    w.emit_call(1);
    w.emit_get_prop(x);
    unit.add_function(Function::new("run", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "run", &[]).unwrap(), Value::Int(3));
    let obj = ctx.create_object("Point", &[Value::Int(9)]).unwrap();
    assert_eq!(obj.borrow().get_prop("x"), Some(Value::Int(9)));
}

#[test]
fn test_undefined_property_reads_null_with_notice() {
    let (mut ctx, _) = context();
    let mut unit = counter_unit();
    let counter = unit.intern("Counter");
    let missing = unit.intern("missing");
    let mut w = BytecodeWriter::new();
    w.emit_push_ctor(counter);
    w.emit_call(0);
    w.emit_get_prop(missing);
    unit.add_function(Function::new("run", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "run", &[]).unwrap(), Value::Null);
    let last = ctx.last_error().expect("notice recorded");
    assert_eq!(last.message, "Undefined property: Counter::$missing");
}

// ===== Magic calls =====

#[test]
fn test_magic_call_receives_name_and_packed_args() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("proxy.st");
    let mut class = ClassDef::new("Proxy", None);
    // return [$name, $args];
    let mut w = BytecodeWriter::new();
    w.emit_new_array();
    w.emit_get_local(0);
    w.emit_add_elem();
    w.emit_get_local(1);
    w.emit_add_elem();
    let magic = Function::new("__call", 2, ret(w))
        .with_params(vec![Param::required("name"), Param::required("args")]);
    unit.add_method(&mut class, magic, Visibility::Public, false);
    unit.classes.push(class);
    load(&mut ctx, unit);

    let obj = ctx.create_object("Proxy", &[]).unwrap();
    let callable = Value::list(vec![Value::Object(obj), Value::str("anything")]);
    let result = ctx
        .call_user_func(&callable, &[Value::Int(1), Value::Int(2)])
        .unwrap();
    let parts = elements(&result);
    assert_eq!(parts[0], Value::str("anything"));
    assert_eq!(elements(&parts[1]), vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn test_magic_call_static_from_guest() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("facade.st");
    let facade = unit.intern("Facade");
    let hello = unit.intern("hello");
    let mut class = ClassDef::new("Facade", None);
    let mut w = BytecodeWriter::new();
    w.emit_get_local(0);
    let magic = Function::new("__callStatic", 2, ret(w))
        .with_params(vec![Param::required("name"), Param::required("args")]);
    unit.add_method(&mut class, magic, Visibility::Public, true);
    unit.classes.push(class);

    let mut w = BytecodeWriter::new();
    w.emit_push_cls_method(facade, hello);
    w.emit_int(1);
    w.emit_call(1);
    unit.add_function(Function::new("run", 0, ret(w)));
    load(&mut ctx, unit);

    assert_eq!(call(&mut ctx, "run", &[]).unwrap(), Value::str("hello"));
}

// ===== Visibility =====

fn vault_unit() -> Unit {
    let mut unit = Unit::new("vault.st");
    let secret = unit.intern("secret");
    let mut class = ClassDef::new("Vault", None);
    let mut w = BytecodeWriter::new();
    w.emit_int(1234);
    unit.add_method(&mut class, Function::new("secret", 0, ret(w)), Visibility::Protected, false);

    let mut w = BytecodeWriter::new();
    w.emit_this();
    w.emit_push_obj_method(secret);
    w.emit_call(0);
    unit.add_method(&mut class, Function::new("open", 0, ret(w)), Visibility::Public, false);
    unit.classes.push(class);
    unit
}

#[test]
fn test_protected_method_hidden_from_global_scope() {
    let (mut ctx, _) = context();
    load(&mut ctx, vault_unit());
    let obj = ctx.create_object("Vault", &[]).unwrap();

    let callable = Value::list(vec![Value::Object(obj.clone()), Value::str("secret")]);
    match ctx.call_user_func(&callable, &[]) {
        Err(VmError::RuntimeError(msg)) => {
            assert_eq!(msg, "Call to protected method Vault::secret() from global scope")
        }
        other => panic!("unexpected result {:?}", other),
    }

    let callable = Value::list(vec![Value::Object(obj), Value::str("open")]);
    assert_eq!(ctx.call_user_func(&callable, &[]).unwrap(), Value::Int(1234));
}

// ===== Constants and instanceof =====

#[test]
fn test_inherited_constant_and_instance_of() {
    let (mut ctx, _) = context();
    let mut unit = Unit::new("consts.st");
    let base = unit.intern("Base");
    let child = unit.intern("Child");
    let k = unit.intern("K");
    let unknown = unit.intern("Unknown");
    let mut class = ClassDef::new("Base", None);
    class.constants.push(ConstDef {
        name: "K".into(),
        value: Constant::Int(7),
    });
    unit.classes.push(class);
    unit.classes.push(ClassDef::new("Child", Some("Base")));

    // return [Child::K, new Child instanceof Base, new Child instanceof Unknown];
    let mut w = BytecodeWriter::new();
    w.emit_new_array();
    w.emit_cls_cns(child, k);
    w.emit_add_elem();
    w.emit_push_ctor(child);
    w.emit_call(0);
    w.emit_instance_of(base);
    w.emit_add_elem();
    w.emit_push_ctor(child);
    w.emit_call(0);
    w.emit_instance_of(unknown);
    w.emit_add_elem();
    unit.add_function(Function::new("run", 0, ret(w)));
    load(&mut ctx, unit);

    let result = call(&mut ctx, "run", &[]).unwrap();
    assert_eq!(
        elements(&result),
        vec![Value::Int(7), Value::Bool(true), Value::Bool(false)]
    );
    assert!(matches!(
        ctx.lookup_cls_cns("Base", "MISSING"),
        Err(VmError::ConstantNotFound { .. })
    ));
}

// ===== Unit loading =====

fn helper_fn() -> Function {
    let mut w = BytecodeWriter::new();
    w.emit_int(1);
    Function::new("helper", 0, ret(w))
}

#[test]
fn test_redeclared_function_registers_nothing() {
    let (mut ctx, _) = context();
    let mut first = Unit::new("first.st");
    first.add_function(helper_fn());
    load(&mut ctx, first);

    let mut clash = counter_unit();
    clash.add_function(helper_fn());
    let err = ctx.load_unit(clash).unwrap_err();
    assert!(matches!(&err, VmError::Fatal(msg) if msg == "Cannot redeclare helper()"));
    assert!(ctx.lookup_class("Counter").is_none());

    load(&mut ctx, counter_unit());
    let made = ctx.call_user_func(&Value::str("Counter::make"), &[]).unwrap();
    assert_eq!(&*made.as_object().expect("object").borrow().class.name, "Counter");
    assert_eq!(call(&mut ctx, "helper", &[]).unwrap(), Value::Int(1));
}

#[test]
fn test_duplicate_within_unit_rejected_before_classes() {
    let (mut ctx, _) = context();
    let mut unit = counter_unit();
    unit.add_function(helper_fn());
    unit.add_function(helper_fn());
    assert!(matches!(ctx.load_unit(unit), Err(VmError::Fatal(_))));
    assert!(ctx.lookup_class("Counter").is_none());
    assert!(ctx.lookup_func("helper").is_none());
}
