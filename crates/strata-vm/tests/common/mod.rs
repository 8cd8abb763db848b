//! Shared helpers for the integration tests
//!
//! Units are assembled by hand with [`BytecodeWriter`]; string operands must
//! be interned into the unit before the instruction that uses them is
//! emitted.

#![allow(dead_code)]

use strata_bytecode::{BytecodeWriter, ExceptionRegion, Function, Opcode, Unit};
use strata_vm::{ExecutionContext, SharedBuffer, UnitId, Value, VmError, VmOptions, VmResult};

/// A context writing into an inspectable buffer
pub fn context() -> (ExecutionContext, SharedBuffer) {
    context_with(VmOptions::default())
}

/// A context with custom options writing into an inspectable buffer
pub fn context_with(options: VmOptions) -> (ExecutionContext, SharedBuffer) {
    let out = SharedBuffer::new();
    let ctx = ExecutionContext::with_output(options, Box::new(out.clone()));
    (ctx, out)
}

/// Terminate a body with `RetC`
pub fn ret(mut w: BytecodeWriter) -> Vec<u8> {
    w.emit_opcode(Opcode::RetC);
    w.into_bytes()
}

/// Install `code` as the unit's pseudo-main
pub fn set_main(unit: &mut Unit, local_count: u16, code: Vec<u8>) {
    let index = unit.add_function(Function::new("main", local_count, code));
    unit.main = Some(index);
}

/// Load a unit that is expected to verify
pub fn load(ctx: &mut ExecutionContext, unit: Unit) -> UnitId {
    ctx.load_unit(unit).expect("unit should verify and load")
}

/// Call a free function by name from native code
pub fn call(ctx: &mut ExecutionContext, name: &str, args: &[Value]) -> VmResult<Value> {
    ctx.call_user_func(&Value::str(name), args)
}

/// Elements of an array value, in order
pub fn elements(value: &Value) -> Vec<Value> {
    value
        .as_array()
        .map(|a| a.borrow().values().cloned().collect())
        .unwrap_or_default()
}

/// Class name and message of a thrown guest exception
pub fn thrown(err: &VmError) -> Option<(String, String)> {
    let exc = err.exception()?.as_object()?;
    let obj = exc.borrow();
    let message = obj.get_prop("message").unwrap_or_default();
    Some((obj.class.name.to_string(), message.to_display_string()))
}

/// A catch region covering `start..end`
pub fn region(start: u32, end: u32, handler: u32) -> ExceptionRegion {
    ExceptionRegion { start, end, handler }
}

/// Emit `new Exception(msg)` followed by `Throw`
pub fn emit_throw_new(w: &mut BytecodeWriter, exception: u32, msg: u32) {
    w.emit_push_ctor(exception);
    w.emit_string(msg);
    w.emit_call(1);
    w.emit_opcode(Opcode::Throw);
}
