//! Control flow opcode handlers: Jmp, JmpZ, JmpNZ, RetC, Throw, Exit

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::value::Value;
use crate::VmError;
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_control_flow_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
        op_pc: usize,
    ) -> OpcodeResult {
        let code = &func.def.code;
        match opcode {
            Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ => {
                let target = vm_try!(self.read_u32(code)) as usize;
                let taken = match opcode {
                    Opcode::Jmp => true,
                    Opcode::JmpZ => !vm_try!(self.stack.pop()).to_bool(),
                    _ => vm_try!(self.stack.pop()).to_bool(),
                };
                if taken {
                    if target <= op_pc {
                        vm_try!(self.check_surprise());
                    }
                    self.regs.pc = target;
                }
                OpcodeResult::Continue
            }

            Opcode::RetC => {
                let value = vm_try!(self.stack.pop());
                vm_try!(self.ret_from_frame(value))
            }

            Opcode::Throw => {
                let exc = vm_try!(self.stack.pop());
                let throwable = exc
                    .as_object()
                    .is_some_and(|o| o.borrow().instance_of(self.classes.builtins.exception));
                if !throwable {
                    return OpcodeResult::Error(VmError::TypeError(format!(
                        "Can only throw objects that extend Exception, {} given",
                        exc.type_name()
                    )));
                }
                OpcodeResult::Throw(exc)
            }

            Opcode::Exit => {
                let status = match vm_try!(self.stack.pop()) {
                    Value::Int(i) => i,
                    Value::Null => 0,
                    other => {
                        self.output.write(other.to_display_string().as_bytes());
                        0
                    }
                };
                OpcodeResult::Error(VmError::Exit(status))
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in control flow handler: {:?}",
                opcode
            ))),
        }
    }
}
