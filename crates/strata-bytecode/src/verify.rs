//! Bytecode verification
//!
//! Units are verified once when they are loaded so the dispatch loop can
//! trust operand indices and jump targets without re-checking them.

use crate::encoder::{BytecodeReader, DecodeError};
use crate::opcode::{Opcode, NO_LOCAL};
use crate::unit::{Function, Unit};
use std::collections::HashSet;

/// Bytecode verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Undecodable instruction stream
    #[error("{function}: {source}")]
    Decode {
        /// Function being verified
        function: String,
        /// Underlying decode error
        source: DecodeError,
    },

    /// Invalid jump target
    #[error("{function}: invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Function being verified
        function: String,
        /// Offending target
        target: usize,
        /// Offset of the jump
        offset: usize,
    },

    /// Invalid string table reference
    #[error("{function}: invalid string reference {index} at offset {offset}")]
    InvalidStringRef {
        /// Function being verified
        function: String,
        /// Offending index
        index: u32,
        /// Offset of the instruction
        offset: usize,
    },

    /// Invalid local variable reference
    #[error("{function}: invalid local {index} (max {max}) at offset {offset}")]
    InvalidLocalRef {
        /// Function being verified
        function: String,
        /// Offending index
        index: usize,
        /// Local count
        max: usize,
        /// Offset of the instruction
        offset: usize,
    },

    /// Invalid iterator reference
    #[error("{function}: invalid iterator {index} (max {max}) at offset {offset}")]
    InvalidIterRef {
        /// Function being verified
        function: String,
        /// Offending index
        index: usize,
        /// Iterator count
        max: usize,
        /// Offset of the instruction
        offset: usize,
    },

    /// Execution falls off end
    #[error("{function}: execution falls off end of function at offset {offset}")]
    FallOffEnd {
        /// Function being verified
        function: String,
        /// Offset of the last instruction
        offset: usize,
    },

    /// Malformed exception region
    #[error("{function}: invalid exception region {start}..{end} -> {handler}")]
    InvalidRegion {
        /// Function being verified
        function: String,
        /// Region start
        start: u32,
        /// Region end
        end: u32,
        /// Handler offset
        handler: u32,
    },

    /// Malformed signature or unit structure
    #[error("Unit validation error: {0}")]
    UnitValidation(String),
}

/// Verify every function and class of a unit
///
/// # Errors
///
/// Returns the first [`VerifyError`] found.
pub fn verify_unit(unit: &Unit) -> Result<(), VerifyError> {
    for function in &unit.functions {
        verify_function(function, unit)?;
    }

    for class in &unit.classes {
        for method in &class.methods {
            if method.function as usize >= unit.functions.len() {
                return Err(VerifyError::UnitValidation(format!(
                    "method {}::{} refers to missing function {}",
                    class.name, method.name, method.function
                )));
            }
        }
    }

    if let Some(main) = unit.main {
        if main as usize >= unit.functions.len() {
            return Err(VerifyError::UnitValidation(format!(
                "pseudo-main refers to missing function {}",
                main
            )));
        }
    }

    Ok(())
}

/// Parsed instruction
#[derive(Debug, Clone, Copy)]
struct Instruction<'a> {
    offset: usize,
    opcode: Opcode,
    operands: &'a [u8],
}

impl Instruction<'_> {
    fn u16_at(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.operands[at], self.operands[at + 1]])
    }

    fn u32_at(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.operands[at],
            self.operands[at + 1],
            self.operands[at + 2],
            self.operands[at + 3],
        ])
    }
}

/// Verify a single function's bytecode against its unit
///
/// # Errors
///
/// Returns the first [`VerifyError`] found.
pub fn verify_function(function: &Function, unit: &Unit) -> Result<(), VerifyError> {
    let name = || function.name.clone();

    if let Some(pos) = function.params.iter().position(|p| p.variadic) {
        if pos + 1 != function.params.len() {
            return Err(VerifyError::UnitValidation(format!(
                "{}: variadic parameter must be last",
                function.name
            )));
        }
    }
    if (function.local_count as usize) < function.params.len() {
        return Err(VerifyError::UnitValidation(format!(
            "{}: {} locals cannot hold {} parameters",
            function.name,
            function.local_count,
            function.params.len()
        )));
    }

    let instructions = parse_instructions(&function.code).map_err(|source| VerifyError::Decode {
        function: name(),
        source,
    })?;
    let boundaries: HashSet<usize> = instructions.iter().map(|i| i.offset).collect();

    let check_target = |target: u32, offset: usize| {
        if boundaries.contains(&(target as usize)) {
            Ok(())
        } else {
            Err(VerifyError::InvalidJumpTarget {
                function: name(),
                target: target as usize,
                offset,
            })
        }
    };
    let check_string = |index: u32, offset: usize| {
        if (index as usize) < unit.strings.len() {
            Ok(())
        } else {
            Err(VerifyError::InvalidStringRef {
                function: name(),
                index,
                offset,
            })
        }
    };
    let check_local = |index: u16, offset: usize| {
        if (index as usize) < function.local_count as usize {
            Ok(())
        } else {
            Err(VerifyError::InvalidLocalRef {
                function: name(),
                index: index as usize,
                max: function.local_count as usize,
                offset,
            })
        }
    };
    let check_iter = |index: u16, offset: usize| {
        if (index as usize) < function.iter_count as usize {
            Ok(())
        } else {
            Err(VerifyError::InvalidIterRef {
                function: name(),
                index: index as usize,
                max: function.iter_count as usize,
                offset,
            })
        }
    };

    for instr in &instructions {
        let off = instr.offset;
        match instr.opcode {
            Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ => check_target(instr.u32_at(0), off)?,
            Opcode::String
            | Opcode::FPushFunc
            | Opcode::FPushObjMethod
            | Opcode::FPushCtor
            | Opcode::CGetProp
            | Opcode::SetProp
            | Opcode::InstanceOfD => check_string(instr.u32_at(0), off)?,
            Opcode::FPushClsMethod | Opcode::ClsCnsD => {
                check_string(instr.u32_at(0), off)?;
                check_string(instr.u32_at(4), off)?;
            }
            Opcode::CGetL | Opcode::SetL => check_local(instr.u16_at(0), off)?,
            Opcode::IterInit | Opcode::IterNext => {
                check_iter(instr.u16_at(0), off)?;
                check_target(instr.u32_at(2), off)?;
                check_local(instr.u16_at(6), off)?;
                let key = instr.u16_at(8);
                if key != NO_LOCAL {
                    check_local(key, off)?;
                }
            }
            Opcode::IterFree => check_iter(instr.u16_at(0), off)?,
            _ => {}
        }
    }

    match instructions.last() {
        Some(last) if last.opcode.is_terminator() => {}
        Some(last) => {
            return Err(VerifyError::FallOffEnd {
                function: name(),
                offset: last.offset,
            })
        }
        None => {
            return Err(VerifyError::FallOffEnd {
                function: name(),
                offset: 0,
            })
        }
    }

    for region in &function.handlers {
        let valid = region.start < region.end
            && region.end as usize <= function.code.len()
            && boundaries.contains(&(region.start as usize))
            && boundaries.contains(&(region.handler as usize));
        if !valid {
            return Err(VerifyError::InvalidRegion {
                function: name(),
                start: region.start,
                end: region.end,
                handler: region.handler,
            });
        }
    }

    Ok(())
}

/// Parse all instructions from bytecode
fn parse_instructions(code: &[u8]) -> Result<Vec<Instruction<'_>>, DecodeError> {
    let mut instructions = Vec::new();
    let mut reader = BytecodeReader::new(code);

    while reader.has_more() {
        let offset = reader.position();
        let opcode = reader.read_opcode()?;
        let operands = reader.read_slice(opcode.operand_size())?;
        instructions.push(Instruction {
            offset,
            opcode,
            operands,
        });
    }

    Ok(instructions)
}
