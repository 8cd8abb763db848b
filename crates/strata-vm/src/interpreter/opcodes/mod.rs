//! Opcode handler modules for the dispatch loop
//!
//! Each module implements a category of opcode handlers as methods on
//! `ExecutionContext`. Handlers read their operands at `regs.pc`, which the
//! loop has already advanced past the opcode byte.

/// Unwrap a `VmResult` inside a handler, turning `Err` into
/// `OpcodeResult::Error`
macro_rules! vm_try {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return $crate::interpreter::OpcodeResult::Error(e),
        }
    };
}

pub mod arithmetic;
pub mod calls;
pub mod comparison;
pub mod control_flow;
pub mod iterators;
pub mod objects;
pub mod resumables;
pub mod stack;

use crate::func::Func;
use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::Opcode;

impl ExecutionContext {
    /// Route one decoded opcode to its category handler
    pub(in crate::interpreter) fn execute_opcode(
        &mut self,
        func: &Rc<Func>,
        opcode: Opcode,
        op_pc: usize,
    ) -> OpcodeResult {
        match opcode {
            Opcode::Nop
            | Opcode::PopC
            | Opcode::Dup
            | Opcode::Null
            | Opcode::True
            | Opcode::False
            | Opcode::Int
            | Opcode::Double
            | Opcode::String
            | Opcode::NewArray
            | Opcode::AddElemC
            | Opcode::AddElemKC
            | Opcode::CGetL
            | Opcode::SetL
            | Opcode::This
            | Opcode::Print => self.exec_stack_ops(func, opcode),

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Concat => self.exec_arithmetic_ops(opcode),

            Opcode::Eq
            | Opcode::Neq
            | Opcode::Same
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Gt
            | Opcode::Gte
            | Opcode::Not => self.exec_comparison_ops(opcode),

            Opcode::Jmp
            | Opcode::JmpZ
            | Opcode::JmpNZ
            | Opcode::RetC
            | Opcode::Throw
            | Opcode::Exit => self.exec_control_flow_ops(func, opcode, op_pc),

            Opcode::FPushFunc
            | Opcode::FPushObjMethod
            | Opcode::FPushClsMethod
            | Opcode::FPushCtor
            | Opcode::FCall => self.exec_call_ops(func, opcode),

            Opcode::CGetProp | Opcode::SetProp | Opcode::InstanceOfD | Opcode::ClsCnsD => {
                self.exec_object_ops(func, opcode)
            }

            Opcode::IterInit | Opcode::IterNext | Opcode::IterFree => {
                self.exec_iterator_ops(func, opcode)
            }

            Opcode::CreateCont | Opcode::Yield | Opcode::YieldK | Opcode::Await => {
                self.exec_resumable_ops(func, opcode, op_pc)
            }
        }
    }

    // ========================================================================
    // Operand readers
    // ========================================================================

    #[inline]
    fn operand<const N: usize>(&mut self, code: &[u8]) -> VmResult<[u8; N]> {
        let pc = self.regs.pc;
        let bytes = code
            .get(pc..pc + N)
            .ok_or_else(|| VmError::StackCorruption(format!("truncated operand at {}", pc)))?;
        self.regs.pc = pc + N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline]
    pub(in crate::interpreter) fn read_u16(&mut self, code: &[u8]) -> VmResult<u16> {
        self.operand::<2>(code).map(u16::from_le_bytes)
    }

    #[inline]
    pub(in crate::interpreter) fn read_u32(&mut self, code: &[u8]) -> VmResult<u32> {
        self.operand::<4>(code).map(u32::from_le_bytes)
    }

    #[inline]
    pub(in crate::interpreter) fn read_i64(&mut self, code: &[u8]) -> VmResult<i64> {
        self.operand::<8>(code).map(i64::from_le_bytes)
    }

    #[inline]
    pub(in crate::interpreter) fn read_f64(&mut self, code: &[u8]) -> VmResult<f64> {
        self.operand::<8>(code).map(f64::from_le_bytes)
    }
}
