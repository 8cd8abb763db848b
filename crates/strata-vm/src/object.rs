//! Runtime classes and object instances

use crate::func::Callee;
use crate::resumable::{GeneratorData, WaitHandleData};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use strata_bytecode::Visibility;

/// Class identifier (index into the class registry)
pub type ClassId = usize;

/// Shared handle to an object instance
pub type ObjectRef = Rc<RefCell<ObjectData>>;

/// Name of the constructor method
pub const CTOR_NAME: &str = "__construct";
/// Name of the instance catch-all method
pub const MAGIC_CALL_NAME: &str = "__call";
/// Name of the static catch-all method
pub const MAGIC_CALL_STATIC_NAME: &str = "__callStatic";

/// A declared property slot
#[derive(Debug, Clone)]
pub struct PropSlot {
    /// Property name
    pub name: Rc<str>,
    /// Initializer
    pub default: Value,
}

/// A method as seen by resolution
#[derive(Clone)]
pub struct MethodEntry {
    /// Method name
    pub name: Rc<str>,
    /// Body
    pub callee: Callee,
    /// Declared visibility
    pub visibility: Visibility,
    /// Static methods never bind `$this`
    pub is_static: bool,
    /// Declaring class
    pub declaring: ClassId,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("is_static", &self.is_static)
            .field("declaring", &self.declaring)
            .finish()
    }
}

/// Runtime class metadata
///
/// Classes are immutable once registered. Properties and constants are
/// flattened from the parent at definition time; methods stay per-class and
/// are found by walking the parent chain.
pub struct Class {
    /// Class ID
    pub id: ClassId,
    /// Class name
    pub name: Rc<str>,
    /// Parent class
    pub parent: Option<Rc<Class>>,
    /// Property layout, inherited slots first
    pub props: Vec<PropSlot>,
    prop_index: FxHashMap<Rc<str>, usize>,
    methods: FxHashMap<Rc<str>, MethodEntry>,
    constants: FxHashMap<Rc<str>, Value>,
}

impl Class {
    /// Create a class inheriting the parent's layout and constants
    pub fn new(id: ClassId, name: &str, parent: Option<Rc<Class>>) -> Self {
        let (props, prop_index, constants) = match &parent {
            Some(p) => (p.props.clone(), p.prop_index.clone(), p.constants.clone()),
            None => Default::default(),
        };
        Self {
            id,
            name: Rc::from(name),
            parent,
            props,
            prop_index,
            methods: FxHashMap::default(),
            constants,
        }
    }

    /// Declare a property, overriding an inherited initializer
    pub fn add_prop(&mut self, name: &str, default: Value) {
        if let Some(&idx) = self.prop_index.get(name) {
            self.props[idx].default = default;
            return;
        }
        let name: Rc<str> = Rc::from(name);
        self.prop_index.insert(name.clone(), self.props.len());
        self.props.push(PropSlot { name, default });
    }

    /// Declare a method
    pub fn add_method(&mut self, entry: MethodEntry) {
        self.methods.insert(entry.name.clone(), entry);
    }

    /// Declare a constant
    pub fn add_constant(&mut self, name: &str, value: Value) {
        self.constants.insert(Rc::from(name), value);
    }

    /// Method declared on this class itself
    pub fn own_method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    /// Method declared on this class or the nearest ancestor
    pub fn find_method(&self, name: &str) -> Option<&MethodEntry> {
        let mut class = self;
        loop {
            if let Some(m) = class.methods.get(name) {
                return Some(m);
            }
            class = class.parent.as_deref()?;
        }
    }

    /// Constructor, own or inherited
    pub fn constructor(&self) -> Option<&MethodEntry> {
        self.find_method(CTOR_NAME)
    }

    /// Class constant, own or inherited
    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    /// Slot index of a declared property
    pub fn prop_index(&self, name: &str) -> Option<usize> {
        self.prop_index.get(name).copied()
    }

    /// Check whether this class is `id` or descends from it
    pub fn is_subclass_of(&self, id: ClassId) -> bool {
        let mut class = self;
        loop {
            if class.id == id {
                return true;
            }
            match class.parent.as_deref() {
                Some(p) => class = p,
                None => return false,
            }
        }
    }

    /// Allocate an instance with property initializers applied
    pub fn instantiate(self: &Rc<Self>) -> ObjectRef {
        Rc::new(RefCell::new(ObjectData {
            class: Rc::clone(self),
            props: self.props.iter().map(|p| p.default.clone()).collect(),
            dyn_props: FxHashMap::default(),
            internal: None,
        }))
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .field("props", &self.props.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Native payload carried by built-in objects
pub enum Internal {
    /// `Generator` instance
    Generator(GeneratorData),
    /// `WaitHandle` instance
    WaitHandle(WaitHandleData),
}

/// An object instance
pub struct ObjectData {
    /// Instantiated class
    pub class: Rc<Class>,
    /// Declared property values, in class layout order
    pub props: Vec<Value>,
    /// Properties assigned without a declaration
    pub dyn_props: FxHashMap<Rc<str>, Value>,
    /// Native payload for built-in classes
    pub internal: Option<Internal>,
}

impl ObjectData {
    /// Read a property
    pub fn get_prop(&self, name: &str) -> Option<Value> {
        match self.class.prop_index(name) {
            Some(idx) => self.props.get(idx).cloned(),
            None => self.dyn_props.get(name).cloned(),
        }
    }

    /// Write a property, creating a dynamic one if undeclared
    pub fn set_prop(&mut self, name: &str, value: Value) {
        match self.class.prop_index(name) {
            Some(idx) => self.props[idx] = value,
            None => {
                self.dyn_props.insert(Rc::from(name), value);
            }
        }
    }

    /// `instanceof` check against a class ID
    pub fn instance_of(&self, id: ClassId) -> bool {
        self.class.is_subclass_of(id)
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("class", &self.class.name)
            .field("props", &self.props.len())
            .field("dyn_props", &self.dyn_props.len())
            .field("internal", &self.internal.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Rc<Class>, Rc<Class>) {
        let mut base = Class::new(0, "Base", None);
        base.add_prop("a", Value::Int(1));
        base.add_constant("K", Value::Int(10));
        let base = Rc::new(base);

        let mut derived = Class::new(1, "Derived", Some(base.clone()));
        derived.add_prop("a", Value::Int(2));
        derived.add_prop("b", Value::Null);
        (base, Rc::new(derived))
    }

    #[test]
    fn test_layout_inherits_and_overrides() {
        let (base, derived) = chain();
        assert_eq!(base.props.len(), 1);
        assert_eq!(derived.props.len(), 2);
        assert_eq!(derived.prop_index("a"), Some(0));
        assert_eq!(derived.props[0].default, Value::Int(2));
        assert_eq!(derived.constant("K"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_instantiate_runs_initializers() {
        let (_, derived) = chain();
        let obj = derived.instantiate();
        assert_eq!(obj.borrow().get_prop("a"), Some(Value::Int(2)));
        obj.borrow_mut().set_prop("dyn", Value::Int(5));
        assert_eq!(obj.borrow().get_prop("dyn"), Some(Value::Int(5)));
        assert!(obj.borrow().instance_of(0));
    }

    #[test]
    fn test_subclass_relation() {
        let (base, derived) = chain();
        assert!(derived.is_subclass_of(base.id));
        assert!(!base.is_subclass_of(derived.id));
    }
}
