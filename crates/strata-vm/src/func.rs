//! Callable targets: loaded guest functions and native built-ins

use crate::interpreter::ExecutionContext;
use crate::object::{ClassId, ObjectRef};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::fmt;
use std::rc::Rc;
use strata_bytecode::Function;

/// Function identifier (index into the unit store)
pub type FuncId = usize;

/// Unit identifier (load order)
pub type UnitId = usize;

/// Per-unit data shared by every function of a loaded unit
#[derive(Debug)]
pub struct UnitInfo {
    /// Unit ID
    pub id: UnitId,
    /// Source path
    pub path: Rc<str>,
    /// Interned string table
    pub strings: Vec<Rc<str>>,
}

/// A loaded guest function
#[derive(Debug)]
pub struct Func {
    /// Function ID
    pub id: FuncId,
    /// Function or method name
    pub name: Rc<str>,
    /// Compiled body and signature
    pub def: Function,
    /// Owning unit
    pub unit: Rc<UnitInfo>,
    /// Declaring class for methods
    pub class: Option<(ClassId, Rc<str>)>,
    /// Static method
    pub is_static: bool,
}

impl Func {
    /// String operand lookup; operands are range-checked at load time
    #[inline]
    pub fn string(&self, index: u32) -> VmResult<&Rc<str>> {
        self.unit.strings.get(index as usize).ok_or_else(|| {
            VmError::RuntimeError(format!("{}: string index {} out of range", self.name, index))
        })
    }

    /// `Class::name` for methods, `name` otherwise
    pub fn full_name(&self) -> String {
        match &self.class {
            Some((_, cls)) => format!("{}::{}", cls, self.name),
            None => self.name.to_string(),
        }
    }

    /// Declaring class ID
    #[inline]
    pub fn class_id(&self) -> Option<ClassId> {
        self.class.as_ref().map(|(id, _)| *id)
    }
}

/// Native function signature: context, optional `$this`, arguments
pub type NativeFn = fn(&mut ExecutionContext, Option<&ObjectRef>, &[Value]) -> VmResult<Value>;

/// A named native built-in
#[derive(Clone)]
pub struct NativeFunc {
    /// Name used for lookup and backtraces
    pub name: Rc<str>,
    /// Handler
    pub call: NativeFn,
}

impl fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunc({})", self.name)
    }
}

/// What an activation record executes
#[derive(Debug, Clone)]
pub enum Callee {
    /// Interpreted bytecode
    Func(Rc<Func>),
    /// Native built-in
    Native(NativeFunc),
}

impl Callee {
    /// Callee name
    pub fn name(&self) -> &Rc<str> {
        match self {
            Callee::Func(f) => &f.name,
            Callee::Native(n) => &n.name,
        }
    }

    /// The guest function, if interpreted
    #[inline]
    pub fn as_func(&self) -> Option<&Rc<Func>> {
        match self {
            Callee::Func(f) => Some(f),
            Callee::Native(_) => None,
        }
    }
}
