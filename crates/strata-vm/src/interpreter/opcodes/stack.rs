//! Stack and local opcode handlers: constants, array literals, CGetL, SetL,
//! This, Print

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::value::{Array, Value};
use crate::VmError;
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_stack_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
    ) -> OpcodeResult {
        let code = &func.def.code;
        match opcode {
            Opcode::Nop => OpcodeResult::Continue,

            Opcode::PopC => {
                vm_try!(self.stack.pop());
                OpcodeResult::Continue
            }

            Opcode::Dup => {
                let top = vm_try!(self.stack.top()).clone();
                vm_try!(self.stack.push(top));
                OpcodeResult::Continue
            }

            Opcode::Null | Opcode::True | Opcode::False => {
                let value = match opcode {
                    Opcode::True => Value::Bool(true),
                    Opcode::False => Value::Bool(false),
                    _ => Value::Null,
                };
                vm_try!(self.stack.push(value));
                OpcodeResult::Continue
            }

            Opcode::Int => {
                let value = vm_try!(self.read_i64(code));
                vm_try!(self.stack.push(Value::Int(value)));
                OpcodeResult::Continue
            }

            Opcode::Double => {
                let value = vm_try!(self.read_f64(code));
                vm_try!(self.stack.push(Value::Double(value)));
                OpcodeResult::Continue
            }

            Opcode::String => {
                let index = vm_try!(self.read_u32(code));
                let s = vm_try!(func.string(index));
                vm_try!(self.stack.push(Value::Str(Rc::clone(s))));
                OpcodeResult::Continue
            }

            Opcode::NewArray => {
                vm_try!(self.stack.push(Value::Array(Array::new().into_ref())));
                OpcodeResult::Continue
            }

            Opcode::AddElemC => {
                let value = vm_try!(self.stack.pop());
                let Value::Array(array) = vm_try!(self.stack.top()) else {
                    return OpcodeResult::Error(VmError::TypeError(
                        "AddElemC target is not an array".into(),
                    ));
                };
                let appended = array.borrow_mut().append(value);
                if !appended {
                    vm_try!(self.raise_warning(
                        "Cannot add element to the array as the next element is already occupied"
                    ));
                }
                OpcodeResult::Continue
            }

            Opcode::AddElemKC => {
                let value = vm_try!(self.stack.pop());
                let key = vm_try!(vm_try!(self.stack.pop()).to_array_key());
                let Value::Array(array) = vm_try!(self.stack.top()) else {
                    return OpcodeResult::Error(VmError::TypeError(
                        "AddElemKC target is not an array".into(),
                    ));
                };
                array.borrow_mut().insert(key, value);
                OpcodeResult::Continue
            }

            Opcode::CGetL => {
                let local = vm_try!(self.read_u16(code));
                let value = vm_try!(self.local(local as usize));
                vm_try!(self.stack.push(value));
                OpcodeResult::Continue
            }

            Opcode::SetL => {
                let local = vm_try!(self.read_u16(code));
                let value = vm_try!(self.stack.pop());
                vm_try!(self.set_local(local as usize, value));
                OpcodeResult::Continue
            }

            Opcode::This => {
                let Some(this) = self.current_this() else {
                    return OpcodeResult::Error(VmError::RuntimeError(
                        "Using $this when not in object context".into(),
                    ));
                };
                vm_try!(self.stack.push(Value::Object(this)));
                OpcodeResult::Continue
            }

            Opcode::Print => {
                let value = vm_try!(self.stack.pop());
                self.output.write(value.to_display_string().as_bytes());
                OpcodeResult::Continue
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in stack handler: {:?}",
                opcode
            ))),
        }
    }
}
