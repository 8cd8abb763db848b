//! Iterator opcode handlers: IterInit, IterNext, IterFree
//!
//! Arrays are walked by position. A generator base is primed on
//! `IterInit` and resumed with null on every `IterNext`.

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::object::{Internal, ObjectRef};
use crate::stack::IterState;
use crate::value::Value;
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::{Opcode, NO_LOCAL};

struct IterOperands {
    iter: usize,
    target: usize,
    value: u16,
    key: u16,
}

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_iterator_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
    ) -> OpcodeResult {
        let code = &func.def.code;
        match opcode {
            Opcode::IterInit | Opcode::IterNext => {
                let ops = IterOperands {
                    iter: vm_try!(self.read_u16(code)) as usize,
                    target: vm_try!(self.read_u32(code)) as usize,
                    value: vm_try!(self.read_u16(code)),
                    key: vm_try!(self.read_u16(code)),
                };
                let result = if opcode == Opcode::IterInit {
                    self.iter_init(&ops)
                } else {
                    self.iter_next(&ops)
                };
                vm_try!(result);
                OpcodeResult::Continue
            }

            Opcode::IterFree => {
                let iter = vm_try!(self.read_u16(code)) as usize;
                vm_try!(self.set_iter(iter, None));
                OpcodeResult::Continue
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in iterator handler: {:?}",
                opcode
            ))),
        }
    }

    fn set_iter(&mut self, iter: usize, state: Option<IterState>) -> VmResult<()> {
        let fp = self.current_fp()?;
        let slot = self
            .stack
            .frame_mut(fp)?
            .iters
            .get_mut(iter)
            .ok_or_else(|| VmError::StackCorruption(format!("iterator {} out of range", iter)))?;
        *slot = state;
        Ok(())
    }

    fn iter_state(&self, iter: usize) -> VmResult<Option<IterState>> {
        let fp = self.current_fp()?;
        self.stack
            .frame(fp)?
            .iters
            .get(iter)
            .cloned()
            .ok_or_else(|| VmError::StackCorruption(format!("iterator {} out of range", iter)))
    }

    fn bind_iter_locals(&mut self, ops: &IterOperands, key: Value, value: Value) -> VmResult<()> {
        self.set_local(ops.value as usize, value)?;
        if ops.key != NO_LOCAL {
            self.set_local(ops.key as usize, key)?;
        }
        Ok(())
    }

    fn iter_init(&mut self, ops: &IterOperands) -> VmResult<()> {
        match self.stack.pop()? {
            Value::Array(array) => {
                let first = array
                    .borrow()
                    .get_index(0)
                    .map(|(k, v)| (k.to_value(), v.clone()));
                match first {
                    Some((key, value)) => {
                        self.set_iter(ops.iter, Some(IterState::Array { array, pos: 0 }))?;
                        self.bind_iter_locals(ops, key, value)
                    }
                    None => {
                        self.regs.pc = ops.target;
                        Ok(())
                    }
                }
            }
            Value::Object(obj) if is_generator(&obj) => {
                self.generator_prime(&obj)?;
                if self.generator_finished(&obj)? {
                    self.regs.pc = ops.target;
                    return Ok(());
                }
                let (key, value) = self.generator_current(&obj)?;
                self.set_iter(ops.iter, Some(IterState::Generator(obj)))?;
                self.bind_iter_locals(ops, key, value)
            }
            other => {
                self.regs.pc = ops.target;
                self.raise_warning(&format!(
                    "Invalid argument supplied for foreach(): {}",
                    other.type_name()
                ))
            }
        }
    }

    fn iter_next(&mut self, ops: &IterOperands) -> VmResult<()> {
        let next = match self.iter_state(ops.iter)? {
            Some(IterState::Array { array, pos }) => {
                let entry = array
                    .borrow()
                    .get_index(pos + 1)
                    .map(|(k, v)| (k.to_value(), v.clone()));
                entry.map(|pair| (IterState::Array { array, pos: pos + 1 }, pair))
            }
            Some(IterState::Generator(obj)) => {
                self.generator_send(&obj, Value::Null)?;
                if self.generator_finished(&obj)? {
                    None
                } else {
                    let pair = self.generator_current(&obj)?;
                    Some((IterState::Generator(obj), pair))
                }
            }
            None => {
                return Err(VmError::StackCorruption(format!(
                    "IterNext on free iterator {}",
                    ops.iter
                )))
            }
        };
        match next {
            Some((state, (key, value))) => {
                self.set_iter(ops.iter, Some(state))?;
                self.bind_iter_locals(ops, key, value)?;
                self.check_surprise()?;
                self.regs.pc = ops.target;
            }
            None => self.set_iter(ops.iter, None)?,
        }
        Ok(())
    }
}

fn is_generator(obj: &ObjectRef) -> bool {
    matches!(obj.borrow().internal, Some(Internal::Generator(_)))
}
