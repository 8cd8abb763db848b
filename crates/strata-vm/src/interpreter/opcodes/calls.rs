//! Call sequence opcode handlers: FPushFunc, FPushObjMethod, FPushClsMethod,
//! FPushCtor, FCall
//!
//! `FPush*` resolve the callee and push a *pre-live* frame above the current
//! one; arguments are then evaluated onto the stack and `FCall` enters it.

use crate::func::{Callee, Func};
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::{CallCtx, ExecutionContext, LookupResult, StackArgsState};
use crate::object::CTOR_NAME;
use crate::stack::{ar_flags, ActRec, CallSubject};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_call_ops(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
    ) -> OpcodeResult {
        let code = &func.def.code;
        match opcode {
            Opcode::FPushFunc => {
                let name = vm_try!(self.read_u32(code));
                let name = Rc::clone(vm_try!(func.string(name)));
                let call = vm_try!(self.resolve_function(&name));
                self.push_pre_live(call, 0);
                OpcodeResult::Continue
            }

            Opcode::FPushObjMethod => {
                let name = vm_try!(self.read_u32(code));
                let name = Rc::clone(vm_try!(func.string(name)));
                let obj = match vm_try!(self.stack.pop()) {
                    Value::Object(obj) => obj,
                    other => {
                        return OpcodeResult::Error(VmError::RuntimeError(format!(
                            "Call to a member function {}() on {}",
                            name,
                            other.type_name()
                        )))
                    }
                };
                let cls = Rc::clone(&obj.borrow().class);
                let ctx = self.get_context_class();
                let found = self.lookup_obj_method(&cls, &name, ctx.as_deref());
                match Self::call_ctx_for(found, Some(&obj), &cls, &name) {
                    Some(call) => {
                        self.push_pre_live(call, 0);
                        OpcodeResult::Continue
                    }
                    None => OpcodeResult::Error(self.method_lookup_error(&cls, &name, ctx.as_deref())),
                }
            }

            Opcode::FPushClsMethod => {
                let class = vm_try!(self.read_u32(code));
                let name = vm_try!(self.read_u32(code));
                let class = Rc::clone(vm_try!(func.string(class)));
                let name = Rc::clone(vm_try!(func.string(name)));
                let cls = vm_try!(self.classes.require(&class));
                let this = self.current_this();
                let ctx = self.get_context_class();
                let found = self.lookup_cls_method(&cls, &name, this.as_ref(), ctx.as_deref());
                if let LookupResult::MethodFoundNoThis(Callee::Func(f)) = &found {
                    if !f.is_static {
                        return OpcodeResult::Error(VmError::RuntimeError(format!(
                            "Non-static method {}() cannot be called statically",
                            f.full_name()
                        )));
                    }
                }
                match Self::call_ctx_for(found, this.as_ref(), &cls, &name) {
                    Some(call) => {
                        self.push_pre_live(call, 0);
                        OpcodeResult::Continue
                    }
                    None => OpcodeResult::Error(self.method_lookup_error(&cls, &name, ctx.as_deref())),
                }
            }

            Opcode::FPushCtor => {
                let class = vm_try!(self.read_u32(code));
                let class = Rc::clone(vm_try!(func.string(class)));
                let cls = vm_try!(self.classes.require(&class));
                let obj = self.create_object_only(&cls);
                vm_try!(self.stack.push(Value::Object(Rc::clone(&obj))));
                let ctx = self.get_context_class();
                match self.lookup_ctor_method(&cls, ctx.as_deref()) {
                    LookupResult::MethodFoundWithThis(callee) => {
                        let call = CallCtx {
                            callee,
                            subject: CallSubject::Object(obj),
                            inv_name: None,
                        };
                        self.push_pre_live(call, ar_flags::CTOR);
                        OpcodeResult::Continue
                    }
                    _ => OpcodeResult::Error(self.method_lookup_error(&cls, CTOR_NAME, ctx.as_deref())),
                }
            }

            Opcode::FCall => {
                let argc = vm_try!(self.read_u16(code)) as usize;
                vm_try!(self.fcall(argc))
            }

            _ => OpcodeResult::Error(VmError::RuntimeError(format!(
                "Unexpected opcode in call handler: {:?}",
                opcode
            ))),
        }
    }

    fn push_pre_live(&mut self, call: CallCtx, flags: u8) {
        let mut ar = ActRec::new(call.callee, call.subject, self.stack.sp());
        if let Some(name) = call.inv_name {
            ar.inv_name = Some(name);
            ar.set_flag(ar_flags::MAGIC_CALL);
        }
        ar.flags |= flags;
        self.stack.push_frame(ar);
    }

    /// Enter the innermost pre-live frame with `argc` arguments on the stack
    fn fcall(&mut self, argc: usize) -> VmResult<OpcodeResult> {
        let fp = self.current_fp()?;
        let id = self
            .stack
            .top_frame_id()
            .filter(|id| id.index() > fp.index())
            .ok_or_else(|| VmError::StackCorruption("FCall without a pre-live frame".into()))?;
        let sp = self.stack.sp();
        let return_pc = self.regs.pc;
        let ar = self.stack.frame_mut(id)?;
        if sp != ar.base + argc {
            return Err(VmError::StackCorruption(format!(
                "FCall of {} with {} arguments but {} stack slots",
                ar.callee.name(),
                argc,
                sp.saturating_sub(ar.base)
            )));
        }
        ar.num_args = argc as u32;
        ar.saved_pc = return_pc;
        ar.prev = Some(fp);
        let magic = ar.has_flag(ar_flags::MAGIC_CALL);

        match ar.callee.clone() {
            Callee::Native(native) => {
                let args = self.stack.pop_n(argc)?;
                let ar = self
                    .stack
                    .pop_frame()
                    .ok_or_else(|| VmError::StackCorruption("pre-live frame vanished".into()))?;
                let result = self.call_native(&native, ar.subject.this(), &args)?;
                if !ar.has_flag(ar_flags::CTOR) {
                    self.stack.push(result)?;
                }
                Ok(OpcodeResult::Continue)
            }
            Callee::Func(_) => {
                if magic {
                    self.shuffle_magic_args(id)?;
                }
                self.prepare_func_entry(id, StackArgsState::Untrimmed)?;
                self.enter_frame(id)?;
                Ok(OpcodeResult::FrameChanged)
            }
        }
    }
}
