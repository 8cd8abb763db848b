//! Object opcode handlers: CGetProp, SetProp, InstanceOfD, ClsCnsD

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::value::Value;
use crate::VmError;
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_object_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
    ) -> OpcodeResult {
        let code = &func.def.code;
        match opcode {
            Opcode::CGetProp => {
                let name = vm_try!(self.read_u32(code));
                let name = Rc::clone(vm_try!(func.string(name)));
                let value = match vm_try!(self.stack.pop()) {
                    Value::Object(obj) => {
                        let found = obj.borrow().get_prop(&name);
                        match found {
                            Some(v) => v,
                            None => {
                                let class = Rc::clone(&obj.borrow().class.name);
                                vm_try!(self.raise_notice(&format!(
                                    "Undefined property: {}::${}",
                                    class, name
                                )));
                                Value::Null
                            }
                        }
                    }
                    other => {
                        vm_try!(self.raise_warning(&format!(
                            "Attempt to read property \"{}\" on {}",
                            name,
                            other.type_name()
                        )));
                        Value::Null
                    }
                };
                vm_try!(self.stack.push(value));
                OpcodeResult::Continue
            }

            Opcode::SetProp => {
                let name = vm_try!(self.read_u32(code));
                let name = Rc::clone(vm_try!(func.string(name)));
                let value = vm_try!(self.stack.pop());
                match vm_try!(self.stack.pop()) {
                    Value::Object(obj) => {
                        obj.borrow_mut().set_prop(&name, value);
                        OpcodeResult::Continue
                    }
                    other => OpcodeResult::Error(VmError::TypeError(format!(
                        "Attempt to assign property \"{}\" on {}",
                        name,
                        other.type_name()
                    ))),
                }
            }

            Opcode::InstanceOfD => {
                let class = vm_try!(self.read_u32(code));
                let class = vm_try!(func.string(class));
                let value = vm_try!(self.stack.pop());
                let result = match (value.as_object(), self.classes.get_by_name(class)) {
                    (Some(obj), Some(cls)) => obj.borrow().instance_of(cls.id),
                    _ => false,
                };
                vm_try!(self.stack.push(Value::Bool(result)));
                OpcodeResult::Continue
            }

            Opcode::ClsCnsD => {
                let class = vm_try!(self.read_u32(code));
                let constant = vm_try!(self.read_u32(code));
                let class = vm_try!(func.string(class));
                let constant = vm_try!(func.string(constant));
                let value = vm_try!(self.lookup_cls_cns(class, constant));
                vm_try!(self.stack.push(value));
                OpcodeResult::Continue
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in object handler: {:?}",
                opcode
            ))),
        }
    }
}
