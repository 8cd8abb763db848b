//! Comparison opcode handlers: Eq, Neq, Same, Lt, Lte, Gt, Gte, Not

use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::value::Value;
use std::cmp::Ordering;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_comparison_ops(&mut self, opcode: Opcode) -> OpcodeResult {
        if opcode == Opcode::Not {
            let v = vm_try!(self.stack.pop());
            vm_try!(self.stack.push(Value::Bool(!v.to_bool())));
            return OpcodeResult::Continue;
        }

        let b = vm_try!(self.stack.pop());
        let a = vm_try!(self.stack.pop());
        let result = match opcode {
            Opcode::Eq => a.loose_eq(&b),
            Opcode::Neq => !a.loose_eq(&b),
            Opcode::Same => a.same(&b),
            Opcode::Lt => a.compare(&b) == Some(Ordering::Less),
            Opcode::Lte => matches!(a.compare(&b), Some(Ordering::Less | Ordering::Equal)),
            Opcode::Gt => a.compare(&b) == Some(Ordering::Greater),
            Opcode::Gte => matches!(a.compare(&b), Some(Ordering::Greater | Ordering::Equal)),
            _ => false,
        };
        vm_try!(self.stack.push(Value::Bool(result)));
        OpcodeResult::Continue
    }
}
