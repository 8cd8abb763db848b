//! Strata VM Bytecode Definitions
//!
//! This crate provides the instruction set, the compiled-unit format and the
//! bytecode verifier shared by the Strata compiler and the execution core.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod opcode;
pub mod unit;
pub mod verify;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError, Label};
pub use opcode::{Opcode, NO_LOCAL};
pub use unit::{
    attrs, ClassDef, ConstDef, Constant, ExceptionRegion, Function, LineEntry, MethodDef, Param,
    PropDef, Unit, UnitError, Visibility,
};
pub use verify::{verify_function, verify_unit, VerifyError};
