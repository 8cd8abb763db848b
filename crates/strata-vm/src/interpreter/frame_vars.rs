//! Variable access on the current frame
//!
//! Named locals live in stack slots. Names without a slot go to the frame's
//! variable environment, which is created on first use. With no frame the
//! request's globals are used.

use super::ExecutionContext;
use crate::stack::{FrameId, VarEnv};
use crate::value::{Array, ArrayKey, Value};
use crate::VmResult;
use std::cell::RefCell;
use std::rc::Rc;

impl ExecutionContext {
    /// Snapshot the current frame's variables into an array
    ///
    /// Named locals come first in slot order, followed by environment-only
    /// names sorted by name. Unnamed temporaries are skipped.
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the current frame is gone.
    pub fn get_local_defined_variables(&self) -> VmResult<Array> {
        let mut vars = Array::new();
        let Some(fp) = self.regs.fp else {
            append_env(&mut vars, &self.globals);
            return Ok(vars);
        };
        let ar = self.stack.frame(fp)?;
        let Some(func) = ar.func() else {
            return Ok(vars);
        };
        for (i, name) in func.def.local_names.iter().enumerate().take(ar.local_count()) {
            let value = self.stack.slot(ar.base + i).cloned().unwrap_or_default();
            vars.insert(ArrayKey::Str(Rc::from(name.as_str())), value);
        }
        if let Some(env) = &ar.var_env {
            append_env(&mut vars, env);
        }
        Ok(vars)
    }

    /// Assign a copy of `value` to a variable of the current frame
    ///
    /// Arrays are copied so later writes on either side stay separate.
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the current frame is gone.
    pub fn set_var(&mut self, name: &str, value: Value) -> VmResult<()> {
        let value = match value {
            Value::Array(array) => Value::Array(array.borrow().clone().into_ref()),
            other => other,
        };
        self.assign_var(name, value)
    }

    /// Bind a variable of the current frame to `value` without copying
    ///
    /// An array handle is shared with the caller.
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the current frame is gone.
    pub fn bind_var(&mut self, name: &str, value: Value) -> VmResult<()> {
        self.assign_var(name, value)
    }

    fn assign_var(&mut self, name: &str, value: Value) -> VmResult<()> {
        let Some(fp) = self.regs.fp else {
            self.globals.borrow_mut().insert(Rc::from(name), value);
            return Ok(());
        };
        let ar = self.stack.frame(fp)?;
        let slot = ar
            .func()
            .and_then(|f| f.def.local_index(name))
            .filter(|&i| i < ar.local_count())
            .map(|i| ar.base + i);
        match slot {
            Some(slot) => self.stack.set_slot(slot, value),
            None => {
                self.frame_var_env(fp)?.borrow_mut().insert(Rc::from(name), value);
                Ok(())
            }
        }
    }

    fn frame_var_env(&mut self, fp: FrameId) -> VmResult<VarEnv> {
        let ar = self.stack.frame_mut(fp)?;
        let env = ar
            .var_env
            .get_or_insert_with(|| Rc::new(RefCell::new(Default::default())));
        Ok(Rc::clone(env))
    }
}

fn append_env(vars: &mut Array, env: &VarEnv) {
    let env = env.borrow();
    let mut names: Vec<&Rc<str>> = env.keys().collect();
    names.sort();
    for name in names {
        let key = ArrayKey::Str(Rc::clone(name));
        if vars.get(&key).is_none() {
            vars.insert(key, env[name].clone());
        }
    }
}
