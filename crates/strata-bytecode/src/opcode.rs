//! Bytecode opcodes for the Strata VM
//!
//! This module defines the instruction set interpreted by the execution core.
//! Every instruction is a single opcode byte followed by fixed-size,
//! little-endian operands (see [`Opcode::operand_size`]).

/// Operand value meaning "no local" for optional local-slot operands
/// (the key slot of `IterInit`/`IterNext`).
pub const NO_LOCAL: u16 = u16::MAX;

/// Bytecode opcode enumeration
///
/// Opcodes are organized into categories:
/// - 0x00-0x0F: Stack manipulation & constants
/// - 0x10-0x1F: Local variables
/// - 0x20-0x2F: Arithmetic & string concatenation
/// - 0x30-0x3F: Comparison & logical
/// - 0x40-0x4F: Control flow
/// - 0x50-0x5F: Call sequence (FPush* / FCall)
/// - 0x60-0x6F: Object & class operations
/// - 0x70-0x7F: Frame exit & output
/// - 0x80-0x8F: Iterators
/// - 0x90-0x9F: Resumables (generators & async functions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack Manipulation & Constants (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Pop and discard the top cell
    PopC = 0x01,
    /// Duplicate the top cell
    Dup = 0x02,
    /// Push null
    Null = 0x03,
    /// Push true
    True = 0x04,
    /// Push false
    False = 0x05,
    /// Push an integer (operand: i64)
    Int = 0x06,
    /// Push a double (operand: f64)
    Double = 0x07,
    /// Push a string from the unit string table (operand: u32 index)
    String = 0x08,
    /// Push a new empty array
    NewArray = 0x09,
    /// Append: `[arr, v] -> [arr]`
    AddElemC = 0x0A,
    /// Keyed insert: `[arr, k, v] -> [arr]`
    AddElemKC = 0x0B,

    // ===== Local Variables (0x10-0x1F) =====
    /// Push a local (operand: u16 local)
    CGetL = 0x10,
    /// Pop into a local (operand: u16 local)
    SetL = 0x11,

    // ===== Arithmetic (0x20-0x2F) =====
    /// `[a, b] -> [a + b]`
    Add = 0x20,
    /// `[a, b] -> [a - b]`
    Sub = 0x21,
    /// `[a, b] -> [a * b]`
    Mul = 0x22,
    /// `[a, b] -> [a / b]`
    Div = 0x23,
    /// `[a, b] -> [a % b]`
    Mod = 0x24,
    /// `[a, b] -> [a . b]`
    Concat = 0x25,

    // ===== Comparison & Logical (0x30-0x3F) =====
    /// Loose equality
    Eq = 0x30,
    /// Loose inequality
    Neq = 0x31,
    /// Strict identity
    Same = 0x32,
    /// Less than
    Lt = 0x33,
    /// Less than or equal
    Lte = 0x34,
    /// Greater than
    Gt = 0x35,
    /// Greater than or equal
    Gte = 0x36,
    /// Logical not
    Not = 0x37,

    // ===== Control Flow (0x40-0x4F) =====
    /// Unconditional jump (operand: u32 absolute target)
    Jmp = 0x40,
    /// Pop, jump if falsy (operand: u32 target)
    JmpZ = 0x41,
    /// Pop, jump if truthy (operand: u32 target)
    JmpNZ = 0x42,

    // ===== Call Sequence (0x50-0x5F) =====
    /// Push a pre-live frame for a named function (operand: u32 name)
    FPushFunc = 0x50,
    /// Pop an object, push a pre-live frame for its method (operand: u32 name)
    FPushObjMethod = 0x51,
    /// Push a pre-live frame for a class method (operands: u32 class, u32 name)
    FPushClsMethod = 0x52,
    /// Allocate an instance, push it, then push a pre-live constructor frame
    /// (operand: u32 class)
    FPushCtor = 0x53,
    /// Enter the innermost pre-live frame (operand: u16 argument count)
    FCall = 0x54,
    /// Push the current `$this`
    This = 0x55,

    // ===== Object & Class Operations (0x60-0x6F) =====
    /// `[obj] -> [obj->name]` (operand: u32 name)
    CGetProp = 0x60,
    /// `[obj, v] -> []` (operand: u32 name)
    SetProp = 0x61,
    /// `[v] -> [v instanceof Class]` (operand: u32 class)
    InstanceOfD = 0x62,
    /// Push a class constant (operands: u32 class, u32 constant)
    ClsCnsD = 0x63,

    // ===== Frame Exit & Output (0x70-0x7F) =====
    /// Return the top cell to the caller
    RetC = 0x70,
    /// Throw the top cell
    Throw = 0x71,
    /// Terminate the request with the top cell as status
    Exit = 0x72,
    /// Write the top cell to the output sink
    Print = 0x73,

    // ===== Iterators (0x80-0x8F) =====
    /// Pop a base and start iterating it
    /// (operands: u16 iter, u32 end target, u16 value local, u16 key local)
    IterInit = 0x80,
    /// Advance an iterator, jumping back while elements remain
    /// (operands: u16 iter, u32 loop target, u16 value local, u16 key local)
    IterNext = 0x81,
    /// Release an iterator (operand: u16 iter)
    IterFree = 0x82,

    // ===== Resumables (0x90-0x9F) =====
    /// Detach the current generator frame and return the generator object
    CreateCont = 0x90,
    /// Suspend the generator, producing the top cell with an automatic key
    Yield = 0x91,
    /// Suspend the generator, producing `[key, value]`
    YieldK = 0x92,
    /// Await a wait handle, suspending the async frame while it is pending
    Await = 0x93,
}

impl Opcode {
    /// Convert byte to opcode
    ///
    /// Returns None if the byte does not correspond to a valid opcode.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            // Stack manipulation & constants
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::PopC),
            0x02 => Some(Self::Dup),
            0x03 => Some(Self::Null),
            0x04 => Some(Self::True),
            0x05 => Some(Self::False),
            0x06 => Some(Self::Int),
            0x07 => Some(Self::Double),
            0x08 => Some(Self::String),
            0x09 => Some(Self::NewArray),
            0x0A => Some(Self::AddElemC),
            0x0B => Some(Self::AddElemKC),

            // Locals
            0x10 => Some(Self::CGetL),
            0x11 => Some(Self::SetL),

            // Arithmetic
            0x20 => Some(Self::Add),
            0x21 => Some(Self::Sub),
            0x22 => Some(Self::Mul),
            0x23 => Some(Self::Div),
            0x24 => Some(Self::Mod),
            0x25 => Some(Self::Concat),

            // Comparison
            0x30 => Some(Self::Eq),
            0x31 => Some(Self::Neq),
            0x32 => Some(Self::Same),
            0x33 => Some(Self::Lt),
            0x34 => Some(Self::Lte),
            0x35 => Some(Self::Gt),
            0x36 => Some(Self::Gte),
            0x37 => Some(Self::Not),

            // Control flow
            0x40 => Some(Self::Jmp),
            0x41 => Some(Self::JmpZ),
            0x42 => Some(Self::JmpNZ),

            // Calls
            0x50 => Some(Self::FPushFunc),
            0x51 => Some(Self::FPushObjMethod),
            0x52 => Some(Self::FPushClsMethod),
            0x53 => Some(Self::FPushCtor),
            0x54 => Some(Self::FCall),
            0x55 => Some(Self::This),

            // Objects
            0x60 => Some(Self::CGetProp),
            0x61 => Some(Self::SetProp),
            0x62 => Some(Self::InstanceOfD),
            0x63 => Some(Self::ClsCnsD),

            // Exits
            0x70 => Some(Self::RetC),
            0x71 => Some(Self::Throw),
            0x72 => Some(Self::Exit),
            0x73 => Some(Self::Print),

            // Iterators
            0x80 => Some(Self::IterInit),
            0x81 => Some(Self::IterNext),
            0x82 => Some(Self::IterFree),

            // Resumables
            0x90 => Some(Self::CreateCont),
            0x91 => Some(Self::Yield),
            0x92 => Some(Self::YieldK),
            0x93 => Some(Self::Await),

            _ => None,
        }
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the mnemonic of this opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::PopC => "PopC",
            Self::Dup => "Dup",
            Self::Null => "Null",
            Self::True => "True",
            Self::False => "False",
            Self::Int => "Int",
            Self::Double => "Double",
            Self::String => "String",
            Self::NewArray => "NewArray",
            Self::AddElemC => "AddElemC",
            Self::AddElemKC => "AddElemKC",
            Self::CGetL => "CGetL",
            Self::SetL => "SetL",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Mod => "Mod",
            Self::Concat => "Concat",
            Self::Eq => "Eq",
            Self::Neq => "Neq",
            Self::Same => "Same",
            Self::Lt => "Lt",
            Self::Lte => "Lte",
            Self::Gt => "Gt",
            Self::Gte => "Gte",
            Self::Not => "Not",
            Self::Jmp => "Jmp",
            Self::JmpZ => "JmpZ",
            Self::JmpNZ => "JmpNZ",
            Self::FPushFunc => "FPushFunc",
            Self::FPushObjMethod => "FPushObjMethod",
            Self::FPushClsMethod => "FPushClsMethod",
            Self::FPushCtor => "FPushCtor",
            Self::FCall => "FCall",
            Self::This => "This",
            Self::CGetProp => "CGetProp",
            Self::SetProp => "SetProp",
            Self::InstanceOfD => "InstanceOfD",
            Self::ClsCnsD => "ClsCnsD",
            Self::RetC => "RetC",
            Self::Throw => "Throw",
            Self::Exit => "Exit",
            Self::Print => "Print",
            Self::IterInit => "IterInit",
            Self::IterNext => "IterNext",
            Self::IterFree => "IterFree",
            Self::CreateCont => "CreateCont",
            Self::Yield => "Yield",
            Self::YieldK => "YieldK",
            Self::Await => "Await",
        }
    }

    /// Size in bytes of the operands following this opcode
    pub fn operand_size(self) -> usize {
        match self {
            Self::Int | Self::Double => 8,
            Self::String
            | Self::Jmp
            | Self::JmpZ
            | Self::JmpNZ
            | Self::FPushFunc
            | Self::FPushObjMethod
            | Self::FPushCtor
            | Self::CGetProp
            | Self::SetProp
            | Self::InstanceOfD => 4,
            Self::FPushClsMethod | Self::ClsCnsD => 8,
            Self::CGetL | Self::SetL | Self::FCall | Self::IterFree => 2,
            Self::IterInit | Self::IterNext => 10,
            _ => 0,
        }
    }

    /// Total encoded length of the instruction (opcode byte + operands)
    #[inline]
    pub fn instruction_len(self) -> usize {
        1 + self.operand_size()
    }

    /// Check if this opcode is a jump instruction
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::JmpZ | Self::JmpNZ | Self::IterInit | Self::IterNext
        )
    }

    /// Check if this opcode enters a callee
    pub fn is_call(self) -> bool {
        matches!(self, Self::FCall)
    }

    /// Check if this opcode leaves the current frame
    pub fn is_return(self) -> bool {
        matches!(self, Self::RetC | Self::CreateCont)
    }

    /// Check if execution can never fall through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::RetC | Self::Throw | Self::Exit | Self::CreateCont
        )
    }

    /// Check if this opcode ends a basic block for single-block dispatch
    pub fn is_control_flow(self) -> bool {
        self.is_jump()
            || self.is_call()
            || self.is_return()
            || matches!(
                self,
                Self::Throw | Self::Exit | Self::Yield | Self::YieldK | Self::Await
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op.to_u8(), byte, "{} does not round-trip", op.name());
            }
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u8(0x0F), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_operand_sizes() {
        assert_eq!(Opcode::Int.instruction_len(), 9);
        assert_eq!(Opcode::FPushClsMethod.operand_size(), 8);
        assert_eq!(Opcode::IterInit.operand_size(), 10);
        assert_eq!(Opcode::RetC.operand_size(), 0);
    }

    #[test]
    fn test_control_flow_detection() {
        assert!(Opcode::JmpZ.is_control_flow());
        assert!(Opcode::FCall.is_control_flow());
        assert!(Opcode::Await.is_control_flow());
        assert!(!Opcode::Add.is_control_flow());
        assert!(!Opcode::FPushFunc.is_control_flow());
    }

    #[test]
    fn test_terminator_detection() {
        assert!(Opcode::RetC.is_terminator());
        assert!(Opcode::Jmp.is_terminator());
        assert!(!Opcode::JmpZ.is_terminator());
        assert!(!Opcode::Yield.is_terminator());
    }
}
