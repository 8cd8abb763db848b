//! Bytecode dispatch loop
//!
//! One loop serves both modes. Continuous dispatch runs until the session's
//! entry frame returns; basic-block dispatch additionally stops after every
//! control-flow instruction so an external driver can interleave.

use super::execution::{BlockExit, DispatchMode, OpcodeResult, Unwound};
use super::{severity, ExecutionContext};
use crate::stack::ar_flags;
use crate::value::Value;
use crate::{VmError, VmResult};
use strata_bytecode::Opcode;

impl ExecutionContext {
    /// Run the current session until its entry frame returns
    ///
    /// # Errors
    ///
    /// Returns an exception nothing in the session caught, `VmError::Exit`,
    /// or a fatal error.
    pub fn dispatch(&mut self) -> VmResult<Value> {
        match self.run(DispatchMode::Continuous)? {
            BlockExit::Returned(value) => Ok(value),
            BlockExit::Continue => Err(VmError::StackCorruption(
                "continuous dispatch stopped at a block boundary".into(),
            )),
        }
    }

    /// Run the current session up to and including the next control-flow
    /// instruction
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub fn dispatch_bb(&mut self) -> VmResult<BlockExit> {
        self.run(DispatchMode::BasicBlock)
    }

    fn run(&mut self, mode: DispatchMode) -> VmResult<BlockExit> {
        'frames: loop {
            let fp = self.current_fp()?;
            let func = self.current_func()?;
            let code = &func.def.code;

            loop {
                let op_pc = self.regs.pc;
                let byte = *code.get(op_pc).ok_or_else(|| {
                    VmError::StackCorruption(format!(
                        "{}: pc {} past end of code",
                        func.full_name(),
                        op_pc
                    ))
                })?;
                let opcode = Opcode::from_u8(byte).ok_or(VmError::InvalidOpcode(byte))?;
                self.regs.pc = op_pc + 1;
                self.stats.opcodes += 1;

                let thrown = match self.execute_opcode(&func, opcode, op_pc) {
                    OpcodeResult::Continue => {
                        if mode == DispatchMode::BasicBlock && opcode.is_control_flow() {
                            return Ok(BlockExit::Continue);
                        }
                        continue;
                    }
                    OpcodeResult::FrameChanged => {
                        if mode == DispatchMode::BasicBlock {
                            return Ok(BlockExit::Continue);
                        }
                        continue 'frames;
                    }
                    OpcodeResult::Return(value) => return Ok(BlockExit::Returned(value)),
                    OpcodeResult::Throw(exc) => exc,
                    OpcodeResult::Error(err) => self.error_to_exception(err)?,
                };

                let fault_pc = if self.regs.fp == Some(fp) {
                    op_pc
                } else {
                    self.regs.pc.saturating_sub(1)
                };
                match self.unwind(thrown, fault_pc)? {
                    Unwound::Resume if mode == DispatchMode::BasicBlock => {
                        return Ok(BlockExit::Continue)
                    }
                    Unwound::Resume => continue 'frames,
                    Unwound::Returned(value) => return Ok(BlockExit::Returned(value)),
                }
            }
        }
    }

    /// Turn an opcode failure into a catchable guest exception, or pass it
    /// through if it must not be caught
    fn error_to_exception(&mut self, err: VmError) -> VmResult<Value> {
        match err {
            VmError::Exception(exc) => Ok(exc),
            VmError::Exit(_) => Err(err),
            err if err.is_fatal() => Err(err),
            err => Ok(self.create_error_exception(&err.to_string(), severity::E_RECOVERABLE_ERROR)),
        }
    }

    /// Unwind `exc` thrown at `fault_pc` in the current frame
    ///
    /// Frames without a covering handler are popped, releasing their locals
    /// and operands. An async frame that never suspended catches the
    /// exception into a failed wait handle instead of propagating it.
    ///
    /// # Errors
    ///
    /// Returns `VmError::Exception` when the exception leaves the session's
    /// entry frame.
    pub(crate) fn unwind(&mut self, exc: Value, fault_pc: usize) -> VmResult<Unwound> {
        let mut fault_pc = fault_pc;
        loop {
            let Some(fp) = self.regs.fp else {
                return Err(VmError::Exception(exc));
            };
            let ar = self.stack.frame(fp)?;
            let func = ar
                .func()
                .cloned()
                .ok_or_else(|| VmError::StackCorruption("unwinding a native frame".into()))?;

            if let Some(region) = func.def.find_handler(fault_pc) {
                let handler = region.handler as usize;
                let locals_end = ar.locals_end();
                self.stack.truncate_frames(fp.index() + 1);
                self.stack.truncate(locals_end);
                self.stack.push(exc)?;
                self.regs.pc = handler;
                return Ok(Unwound::Resume);
            }

            self.write_back_var_env(fp)?;
            self.stack.truncate_frames(fp.index() + 1);
            let ar = self
                .stack
                .pop_frame()
                .ok_or_else(|| VmError::StackCorruption("unwind with no frame".into()))?;
            self.stack.truncate(ar.base);
            let from_entry = ar.has_flag(ar_flags::FROM_VM_ENTRY);

            if let Some(link) = &ar.resume {
                self.regs.fp = None;
                let is_async = func.def.is_async();
                self.complete_resumable(link, Err(exc.clone()))?;
                return if is_async {
                    Ok(Unwound::Returned(Value::Null))
                } else {
                    Err(VmError::Exception(exc))
                };
            }

            if func.def.is_async() {
                let handle = self.finished_wait_handle(Err(exc))?;
                if from_entry {
                    self.regs.fp = None;
                    return Ok(Unwound::Returned(handle));
                }
                let prev = ar
                    .prev
                    .ok_or_else(|| VmError::StackCorruption("frame without caller".into()))?;
                self.set_frame(prev, ar.saved_pc)?;
                if !ar.has_flag(ar_flags::CTOR) {
                    self.stack.push(handle)?;
                }
                return Ok(Unwound::Resume);
            }

            if from_entry {
                self.regs.fp = None;
                return Err(VmError::Exception(exc));
            }
            let prev = ar
                .prev
                .ok_or_else(|| VmError::StackCorruption("frame without caller".into()))?;
            self.set_frame(prev, ar.saved_pc)?;
            fault_pc = ar.saved_pc.saturating_sub(1);
        }
    }
}
