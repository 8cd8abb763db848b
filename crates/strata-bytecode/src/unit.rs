//! Compiled unit format
//!
//! A [`Unit`] is what the compiler hands to the execution core: a string
//! table, function bodies with their signatures and exception regions, and
//! class declarations. Units round-trip through JSON so they can be cached
//! or shipped between processes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unit (de)serialization errors
#[derive(Debug, Error)]
pub enum UnitError {
    /// Malformed JSON
    #[error("Unit JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Function attribute flags
pub mod attrs {
    /// Body starts with `CreateCont`; calling it produces a generator
    pub const GENERATOR: u32 = 1 << 0;
    /// Async function; may `Await`
    pub const ASYNC: u32 = 1 << 1;
    /// Keeps surplus arguments in the frame's extra-args table
    pub const ACCEPTS_EXTRA_ARGS: u32 = 1 << 2;
    /// Unit pseudo-main
    pub const PSEUDO_MAIN: u32 = 1 << 3;
}

/// A literal value usable as a parameter default, property initializer or
/// class constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// `null`
    Null,
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Floating-point literal
    Double(f64),
    /// String literal
    Str(String),
}

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Default used when the argument is missing; `None` means required
    #[serde(default)]
    pub default: Option<Constant>,
    /// Collects all remaining arguments into an array (last parameter only)
    #[serde(default)]
    pub variadic: bool,
}

impl Param {
    /// A required positional parameter
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            variadic: false,
        }
    }

    /// An optional positional parameter
    pub fn optional(name: impl Into<String>, default: Constant) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
            variadic: false,
        }
    }

    /// A variadic parameter
    pub fn variadic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            variadic: true,
        }
    }
}

/// A protected bytecode range and its catch entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    /// First protected offset
    pub start: u32,
    /// One past the last protected offset
    pub end: u32,
    /// Catch entry; the exception is pushed before jumping here
    pub handler: u32,
}

impl ExceptionRegion {
    /// Check whether `pc` lies in the protected range
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        (self.start as usize) <= pc && pc < self.end as usize
    }
}

/// Maps a bytecode offset to a source line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// First offset covered by this line
    pub pc: u32,
    /// Source line
    pub line: u32,
}

/// Function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Function name (method name for class methods)
    pub name: String,
    /// Declared parameters; parameter `i` lives in local `i`
    #[serde(default)]
    pub params: Vec<Param>,
    /// Total local slots, parameters included
    pub local_count: u16,
    /// Names of the leading locals, used for variable environments
    #[serde(default)]
    pub local_names: Vec<String>,
    /// Number of iterator slots
    #[serde(default)]
    pub iter_count: u16,
    /// [`attrs`] flags
    #[serde(default)]
    pub attrs: u32,
    /// Bytecode instructions
    pub code: Vec<u8>,
    /// Exception regions, innermost first for nested ranges
    #[serde(default)]
    pub handlers: Vec<ExceptionRegion>,
    /// Line table sorted by offset
    #[serde(default)]
    pub lines: Vec<LineEntry>,
}

impl Function {
    /// Create a function with the given name and body
    pub fn new(name: impl Into<String>, local_count: u16, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            local_count,
            local_names: Vec::new(),
            iter_count: 0,
            attrs: 0,
            code,
            handlers: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Set the declared parameters, naming their locals
    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        for (i, param) in params.iter().enumerate() {
            if self.local_names.len() <= i {
                self.local_names.push(param.name.clone());
            }
        }
        self.params = params;
        self
    }

    /// Add attribute flags
    pub fn with_attrs(mut self, attrs: u32) -> Self {
        self.attrs |= attrs;
        self
    }

    /// Set the iterator slot count
    pub fn with_iters(mut self, iter_count: u16) -> Self {
        self.iter_count = iter_count;
        self
    }

    /// Check for the generator attribute
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.attrs & attrs::GENERATOR != 0
    }

    /// Check for the async attribute
    #[inline]
    pub fn is_async(&self) -> bool {
        self.attrs & attrs::ASYNC != 0
    }

    /// Check whether surplus arguments go to the extra-args table
    #[inline]
    pub fn accepts_extra_args(&self) -> bool {
        self.attrs & attrs::ACCEPTS_EXTRA_ARGS != 0
    }

    /// Check whether the last parameter is variadic
    #[inline]
    pub fn has_variadic(&self) -> bool {
        self.params.last().is_some_and(|p| p.variadic)
    }

    /// Number of positional (non-variadic) parameters
    #[inline]
    pub fn num_positional_params(&self) -> usize {
        self.params.len() - usize::from(self.has_variadic())
    }

    /// Find the innermost exception region covering `pc`
    pub fn find_handler(&self, pc: usize) -> Option<&ExceptionRegion> {
        self.handlers
            .iter()
            .filter(|r| r.contains(pc))
            .min_by_key(|r| r.end - r.start)
    }

    /// Source line for a bytecode offset
    pub fn line_for_pc(&self, pc: usize) -> Option<u32> {
        let idx = self.lines.partition_point(|e| e.pc as usize <= pc);
        idx.checked_sub(1).map(|i| self.lines[i].line)
    }

    /// Local slot index of a named local
    pub fn local_index(&self, name: &str) -> Option<usize> {
        self.local_names.iter().position(|n| n == name)
    }
}

/// Member visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Visibility {
    /// Accessible everywhere
    #[default]
    Public,
    /// Accessible from the declaring class hierarchy
    Protected,
    /// Accessible from the declaring class only
    Private,
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Index of the body in [`Unit::functions`]
    pub function: u32,
    /// Visibility
    #[serde(default)]
    pub visibility: Visibility,
    /// Static methods never receive `$this`
    #[serde(default)]
    pub is_static: bool,
}

/// Property declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropDef {
    /// Property name
    pub name: String,
    /// Initial value
    pub default: Constant,
}

/// Class constant declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstDef {
    /// Constant name
    pub name: String,
    /// Value
    pub value: Constant,
}

/// Class definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    /// Class name
    pub name: String,
    /// Parent class name
    #[serde(default)]
    pub parent: Option<String>,
    /// Declared properties
    #[serde(default)]
    pub props: Vec<PropDef>,
    /// Declared methods
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    /// Declared constants
    #[serde(default)]
    pub constants: Vec<ConstDef>,
}

impl ClassDef {
    /// Create an empty class definition
    pub fn new(name: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(str::to_string),
            props: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
        }
    }
}

/// A compiled source or eval unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Source path reported in errors and backtraces
    pub path: String,
    /// String table referenced by instruction operands
    #[serde(default)]
    pub strings: Vec<String>,
    /// Function bodies (free functions and methods)
    #[serde(default)]
    pub functions: Vec<Function>,
    /// Classes, in definition order
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    /// Pseudo-main function index
    #[serde(default)]
    pub main: Option<u32>,
}

impl Unit {
    /// Create an empty unit
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Intern a string, returning its table index
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.strings.iter().position(|e| e == s) {
            return idx as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    /// Look up a string table entry
    pub fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    /// Add a function, returning its index
    pub fn add_function(&mut self, function: Function) -> u32 {
        self.functions.push(function);
        (self.functions.len() - 1) as u32
    }

    /// Add a method body to a class definition
    pub fn add_method(
        &mut self,
        class: &mut ClassDef,
        function: Function,
        visibility: Visibility,
        is_static: bool,
    ) {
        let name = function.name.clone();
        let index = self.add_function(function);
        class.methods.push(MethodDef {
            name,
            function: index,
            visibility,
            is_static,
        });
    }

    /// Parse a unit from JSON
    ///
    /// # Errors
    ///
    /// Returns `UnitError::Json` on malformed input.
    pub fn from_json(json: &str) -> Result<Self, UnitError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the unit to JSON
    ///
    /// # Errors
    ///
    /// Returns `UnitError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, UnitError> {
        Ok(serde_json::to_string(self)?)
    }
}
