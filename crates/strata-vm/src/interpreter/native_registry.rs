//! Registry of native built-in functions
//!
//! Call opcodes resolve a name against loaded guest functions first and fall
//! back to this table.

use super::ExecutionContext;
use crate::func::{NativeFn, NativeFunc};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Native functions indexed by name
#[derive(Debug, Default)]
pub(crate) struct NativeRegistry {
    by_name: FxHashMap<Rc<str>, NativeFunc>,
}

impl NativeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a native function
    pub fn register(&mut self, name: &str, call: NativeFn) {
        let name: Rc<str> = Rc::from(name);
        self.by_name.insert(name.clone(), NativeFunc { name, call });
    }

    /// Get a native function by name
    pub fn get(&self, name: &str) -> Option<&NativeFunc> {
        self.by_name.get(name)
    }

    /// Number of registered natives
    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

impl ExecutionContext {
    /// Register a native function callable from guest code by name
    pub fn register_native(&mut self, name: &str, call: NativeFn) {
        self.natives.register(name, call);
    }
}
