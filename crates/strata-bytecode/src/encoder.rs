//! Bytecode encoding and decoding utilities
//!
//! This module provides tools for encoding and decoding Strata bytecode instructions.

use crate::opcode::{Opcode, NO_LOCAL};
use thiserror::Error;

/// Errors that can occur during bytecode decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of bytecode stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid opcode
    #[error("Invalid opcode {0} at offset {1}")]
    InvalidOpcode(u8, usize),
}

/// A forward jump operand awaiting its target
///
/// Returned by the `*_forward` emitters and resolved with [`BytecodeWriter::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an unbound label leaves a zero jump target"]
pub struct Label(usize);

/// Bytecode writer for encoding instructions
///
/// Provides methods for emitting opcodes and their operands into a binary buffer.
pub struct BytecodeWriter {
    buffer: Vec<u8>,
}

impl BytecodeWriter {
    /// Create a new bytecode writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Get the current bytecode buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the bytecode buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset (length of bytecode)
    pub fn offset(&self) -> u32 {
        self.buffer.len() as u32
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit signed integer (little-endian)
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit float (little-endian)
    pub fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit an opcode byte
    pub fn emit_opcode(&mut self, opcode: Opcode) {
        self.emit_u8(opcode.to_u8());
    }

    // ===== Stack & Constants =====

    /// Emit NOP
    pub fn emit_nop(&mut self) {
        self.emit_opcode(Opcode::Nop);
    }

    /// Emit POPC
    pub fn emit_pop(&mut self) {
        self.emit_opcode(Opcode::PopC);
    }

    /// Emit DUP
    pub fn emit_dup(&mut self) {
        self.emit_opcode(Opcode::Dup);
    }

    /// Emit NULL
    pub fn emit_null(&mut self) {
        self.emit_opcode(Opcode::Null);
    }

    /// Emit TRUE or FALSE
    pub fn emit_bool(&mut self, value: bool) {
        self.emit_opcode(if value { Opcode::True } else { Opcode::False });
    }

    /// Emit INT
    pub fn emit_int(&mut self, value: i64) {
        self.emit_opcode(Opcode::Int);
        self.emit_i64(value);
    }

    /// Emit DOUBLE
    pub fn emit_double(&mut self, value: f64) {
        self.emit_opcode(Opcode::Double);
        self.emit_f64(value);
    }

    /// Emit STRING
    pub fn emit_string(&mut self, index: u32) {
        self.emit_opcode(Opcode::String);
        self.emit_u32(index);
    }

    /// Emit NEWARRAY
    pub fn emit_new_array(&mut self) {
        self.emit_opcode(Opcode::NewArray);
    }

    /// Emit ADDELEMC
    pub fn emit_add_elem(&mut self) {
        self.emit_opcode(Opcode::AddElemC);
    }

    /// Emit ADDELEMKC
    pub fn emit_add_elem_k(&mut self) {
        self.emit_opcode(Opcode::AddElemKC);
    }

    // ===== Locals =====

    /// Emit CGETL
    pub fn emit_get_local(&mut self, local: u16) {
        self.emit_opcode(Opcode::CGetL);
        self.emit_u16(local);
    }

    /// Emit SETL
    pub fn emit_set_local(&mut self, local: u16) {
        self.emit_opcode(Opcode::SetL);
        self.emit_u16(local);
    }

    // ===== Control Flow =====

    /// Emit a jump-family instruction with a known target
    pub fn emit_jump(&mut self, op: Opcode, target: u32) {
        debug_assert!(matches!(op, Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ));
        self.emit_opcode(op);
        self.emit_u32(target);
    }

    /// Emit a jump-family instruction whose target is bound later
    pub fn emit_jump_forward(&mut self, op: Opcode) -> Label {
        debug_assert!(matches!(op, Opcode::Jmp | Opcode::JmpZ | Opcode::JmpNZ));
        self.emit_opcode(op);
        let label = Label(self.buffer.len());
        self.emit_u32(0);
        label
    }

    /// Bind a forward label to the current offset
    pub fn bind(&mut self, label: Label) {
        let target = self.offset();
        self.patch_u32(label.0, target);
    }

    /// Patch a previously emitted u32 value at the given offset
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    // ===== Calls =====

    /// Emit FPUSHFUNC
    pub fn emit_push_func(&mut self, name: u32) {
        self.emit_opcode(Opcode::FPushFunc);
        self.emit_u32(name);
    }

    /// Emit FPUSHOBJMETHOD
    pub fn emit_push_obj_method(&mut self, name: u32) {
        self.emit_opcode(Opcode::FPushObjMethod);
        self.emit_u32(name);
    }

    /// Emit FPUSHCLSMETHOD
    pub fn emit_push_cls_method(&mut self, class: u32, name: u32) {
        self.emit_opcode(Opcode::FPushClsMethod);
        self.emit_u32(class);
        self.emit_u32(name);
    }

    /// Emit FPUSHCTOR
    pub fn emit_push_ctor(&mut self, class: u32) {
        self.emit_opcode(Opcode::FPushCtor);
        self.emit_u32(class);
    }

    /// Emit FCALL
    pub fn emit_call(&mut self, arg_count: u16) {
        self.emit_opcode(Opcode::FCall);
        self.emit_u16(arg_count);
    }

    /// Emit THIS
    pub fn emit_this(&mut self) {
        self.emit_opcode(Opcode::This);
    }

    // ===== Objects =====

    /// Emit CGETPROP
    pub fn emit_get_prop(&mut self, name: u32) {
        self.emit_opcode(Opcode::CGetProp);
        self.emit_u32(name);
    }

    /// Emit SETPROP
    pub fn emit_set_prop(&mut self, name: u32) {
        self.emit_opcode(Opcode::SetProp);
        self.emit_u32(name);
    }

    /// Emit INSTANCEOFD
    pub fn emit_instance_of(&mut self, class: u32) {
        self.emit_opcode(Opcode::InstanceOfD);
        self.emit_u32(class);
    }

    /// Emit CLSCNSD
    pub fn emit_cls_cns(&mut self, class: u32, constant: u32) {
        self.emit_opcode(Opcode::ClsCnsD);
        self.emit_u32(class);
        self.emit_u32(constant);
    }

    // ===== Iterators =====

    /// Emit ITERINIT with its end target bound later
    pub fn emit_iter_init(&mut self, iter: u16, value: u16, key: Option<u16>) -> Label {
        self.emit_opcode(Opcode::IterInit);
        self.emit_u16(iter);
        let label = Label(self.buffer.len());
        self.emit_u32(0);
        self.emit_u16(value);
        self.emit_u16(key.unwrap_or(NO_LOCAL));
        label
    }

    /// Emit ITERNEXT jumping back to `loop_target`
    pub fn emit_iter_next(&mut self, iter: u16, loop_target: u32, value: u16, key: Option<u16>) {
        self.emit_opcode(Opcode::IterNext);
        self.emit_u16(iter);
        self.emit_u32(loop_target);
        self.emit_u16(value);
        self.emit_u16(key.unwrap_or(NO_LOCAL));
    }

    /// Emit ITERFREE
    pub fn emit_iter_free(&mut self, iter: u16) {
        self.emit_opcode(Opcode::IterFree);
        self.emit_u16(iter);
    }
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode reader for decoding instructions
///
/// Provides methods for reading opcodes and their operands from a binary buffer.
pub struct BytecodeReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BytecodeReader<'a> {
    /// Create a new bytecode reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a specific position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Read `len` raw bytes
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_slice(1)?[0])
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_slice(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_slice(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a 64-bit signed integer (little-endian)
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read_slice(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    /// Read a 64-bit float (little-endian)
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read_slice(8)?);
        Ok(f64::from_le_bytes(bytes))
    }

    /// Read an opcode byte
    pub fn read_opcode(&mut self) -> Result<Opcode, DecodeError> {
        let offset = self.position;
        let byte = self.read_u8()?;
        Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))
    }
}
