//! Resumable opcode handlers: CreateCont, Yield, YieldK, Await

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::VmError;
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_resumable_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
        op_pc: usize,
    ) -> OpcodeResult {
        match opcode {
            Opcode::CreateCont => vm_try!(self.create_cont(func)),

            Opcode::Yield => {
                let value = vm_try!(self.stack.pop());
                vm_try!(self.yield_value(None, value, op_pc))
            }

            Opcode::YieldK => {
                let value = vm_try!(self.stack.pop());
                let key = vm_try!(self.stack.pop());
                vm_try!(self.yield_value(Some(key), value, op_pc))
            }

            Opcode::Await => {
                let awaited = vm_try!(self.stack.pop());
                vm_try!(self.await_handle(func, awaited, op_pc))
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in resumable handler: {:?}",
                opcode
            ))),
        }
    }
}
