//! Compiled-unit store
//!
//! Loading a unit verifies its bytecode, interns its string table, defines
//! its classes in declaration order and registers its free functions by name.

use super::ExecutionContext;
use crate::func::{Func, UnitId, UnitInfo};
use crate::object::{Class, MethodEntry};
use crate::value::Value;
use crate::{VmError, VmResult};
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use strata_bytecode::{attrs, verify_unit, Function, Unit};
use tracing::debug;

/// A loaded unit
#[derive(Debug)]
pub(crate) struct LoadedUnit {
    pub info: Rc<UnitInfo>,
    pub main: Option<Rc<Func>>,
}

/// Loaded units and their functions
#[derive(Debug, Default)]
pub(crate) struct UnitStore {
    units: Vec<LoadedUnit>,
    funcs: Vec<Rc<Func>>,
    by_name: FxHashMap<Rc<str>, Rc<Func>>,
}

impl UnitStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a free function by name
    pub fn function(&self, name: &str) -> Option<&Rc<Func>> {
        self.by_name.get(name)
    }

    /// Look up a loaded unit
    pub fn unit(&self, id: UnitId) -> Option<&LoadedUnit> {
        self.units.get(id)
    }

    fn next_func(&mut self, func: Func) -> Rc<Func> {
        let func = Rc::new(func);
        self.funcs.push(Rc::clone(&func));
        func
    }
}

impl ExecutionContext {
    /// Verify and load a compiled unit
    ///
    /// # Errors
    ///
    /// - `VmError::Verify` if the bytecode is malformed
    /// - `VmError::ClassNotFound` if a parent class is not defined yet
    /// - `VmError::Fatal` on a duplicate class or function name
    ///
    /// Name collisions are found before any class or function of the unit is
    /// registered, so a rejected unit leaves the context unchanged.
    pub fn load_unit(&mut self, mut unit: Unit) -> VmResult<UnitId> {
        verify_unit(&unit)?;
        self.check_unit_names(&unit)?;

        let id = self.units.units.len();
        let info = Rc::new(UnitInfo {
            id,
            path: Rc::from(unit.path.as_str()),
            strings: unit.strings.iter().map(|s| Rc::from(s.as_str())).collect(),
        });
        let mut bodies: Vec<Option<Function>> =
            std::mem::take(&mut unit.functions).into_iter().map(Some).collect();

        for def in &unit.classes {
            let parent = match &def.parent {
                Some(name) => Some(self.classes.require(name)?),
                None => None,
            };
            let class_id = self.classes.next_class_id();
            let mut class = Class::new(class_id, &def.name, parent);
            for prop in &def.props {
                class.add_prop(&prop.name, Value::from(&prop.default));
            }
            for cns in &def.constants {
                class.add_constant(&cns.name, Value::from(&cns.value));
            }
            let class_name: Rc<str> = Rc::from(def.name.as_str());
            for m in &def.methods {
                let body = bodies
                    .get_mut(m.function as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        VmError::Fatal(format!(
                            "{}::{} shares a body with another method",
                            def.name, m.name
                        ))
                    })?;
                let func = self.units.next_func(Func {
                    id: self.units.funcs.len(),
                    name: Rc::from(m.name.as_str()),
                    def: body,
                    unit: Rc::clone(&info),
                    class: Some((class_id, Rc::clone(&class_name))),
                    is_static: m.is_static,
                });
                class.add_method(MethodEntry {
                    name: Rc::clone(&func.name),
                    callee: crate::func::Callee::Func(func),
                    visibility: m.visibility,
                    is_static: m.is_static,
                    declaring: class_id,
                });
            }
            self.classes.register_class(class)?;
        }

        let mut main = None;
        for (index, body) in bodies.into_iter().enumerate() {
            let Some(mut body) = body else { continue };
            let is_main = unit.main == Some(index as u32) || body.attrs & attrs::PSEUDO_MAIN != 0;
            if is_main {
                body.attrs |= attrs::PSEUDO_MAIN;
            }
            let func = self.units.next_func(Func {
                id: self.units.funcs.len(),
                name: Rc::from(body.name.as_str()),
                def: body,
                unit: Rc::clone(&info),
                class: None,
                is_static: false,
            });
            if is_main {
                main = Some(func);
                continue;
            }
            if self.units.by_name.contains_key(&func.name) {
                return Err(VmError::Fatal(format!(
                    "Cannot redeclare {}()",
                    func.name
                )));
            }
            self.units.by_name.insert(Rc::clone(&func.name), func);
        }

        debug!(
            target: "strata::vm",
            unit = %info.path,
            functions = self.units.funcs.len(),
            classes = unit.classes.len(),
            "loaded unit"
        );
        self.units.units.push(LoadedUnit { info, main });
        Ok(id)
    }

    /// Reject a unit whose declarations would collide, before anything in it
    /// is registered
    fn check_unit_names(&self, unit: &Unit) -> VmResult<()> {
        let mut classes: FxHashSet<&str> = FxHashSet::default();
        let mut method_bodies: FxHashSet<u32> = FxHashSet::default();
        for def in &unit.classes {
            if let Some(parent) = &def.parent {
                if !classes.contains(parent.as_str()) {
                    self.classes.require(parent)?;
                }
            }
            if self.classes.get_by_name(&def.name).is_some() || !classes.insert(def.name.as_str()) {
                return Err(VmError::Fatal(format!(
                    "Cannot declare class {}, because the name is already in use",
                    def.name
                )));
            }
            for m in &def.methods {
                if !method_bodies.insert(m.function) {
                    return Err(VmError::Fatal(format!(
                        "{}::{} shares a body with another method",
                        def.name, m.name
                    )));
                }
            }
        }

        let mut functions: FxHashSet<&str> = FxHashSet::default();
        for (index, body) in unit.functions.iter().enumerate() {
            let index = index as u32;
            let is_main = unit.main == Some(index) || body.attrs & attrs::PSEUDO_MAIN != 0;
            if is_main || method_bodies.contains(&index) {
                continue;
            }
            if self.units.by_name.contains_key(body.name.as_str())
                || !functions.insert(body.name.as_str())
            {
                return Err(VmError::Fatal(format!("Cannot redeclare {}()", body.name)));
            }
        }
        Ok(())
    }

    /// Parse, verify and load a unit from JSON
    ///
    /// # Errors
    ///
    /// Returns `VmError::RuntimeError` on malformed JSON, otherwise the
    /// errors of [`load_unit`](Self::load_unit).
    pub fn load_unit_json(&mut self, json: &str) -> VmResult<UnitId> {
        let unit = Unit::from_json(json).map_err(|e| VmError::RuntimeError(e.to_string()))?;
        self.load_unit(unit)
    }

    /// Look up a loaded free function by name
    pub fn lookup_func(&self, name: &str) -> Option<Rc<Func>> {
        self.units.function(name).cloned()
    }
}
