//! Class registry for runtime class metadata

use crate::object::{Class, ClassId};
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// IDs of the classes the interpreter itself instantiates
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BuiltinClasses {
    pub exception: ClassId,
    pub error_exception: ClassId,
    pub generator: ClassId,
    pub wait_handle: ClassId,
}

/// Class registry for a request
#[derive(Debug, Default)]
pub(crate) struct ClassRegistry {
    /// Classes indexed by ID
    classes: Vec<Rc<Class>>,
    /// Class name to ID mapping
    name_to_id: FxHashMap<Rc<str>, ClassId>,
    /// Built-in class IDs, filled in at request init
    pub builtins: BuiltinClasses,
}

impl ClassRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get next available class ID
    pub fn next_class_id(&self) -> ClassId {
        self.classes.len()
    }

    /// Register a new class
    ///
    /// # Errors
    ///
    /// Returns `VmError::Fatal` if the name is already taken or the ID is not
    /// the next free one.
    pub fn register_class(&mut self, class: Class) -> VmResult<Rc<Class>> {
        if self.name_to_id.contains_key(&class.name) {
            return Err(VmError::Fatal(format!(
                "Cannot declare class {}, because the name is already in use",
                class.name
            )));
        }
        if class.id != self.classes.len() {
            return Err(VmError::Fatal(format!(
                "class {} registered with stale id {}",
                class.name, class.id
            )));
        }
        let class = Rc::new(class);
        self.name_to_id.insert(class.name.clone(), class.id);
        self.classes.push(Rc::clone(&class));
        Ok(class)
    }

    /// Get class by ID
    pub fn get(&self, id: ClassId) -> Option<&Rc<Class>> {
        self.classes.get(id)
    }

    /// Get class by name
    pub fn get_by_name(&self, name: &str) -> Option<&Rc<Class>> {
        self.name_to_id.get(name).and_then(|id| self.classes.get(*id))
    }

    /// Get class by name, failing if undefined
    ///
    /// # Errors
    ///
    /// Returns `VmError::ClassNotFound` if no class has that name.
    pub fn require(&self, name: &str) -> VmResult<Rc<Class>> {
        self.get_by_name(name)
            .cloned()
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }
}
