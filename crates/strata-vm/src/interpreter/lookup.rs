//! Method and object resolution
//!
//! Resolution maps a (class, method name, calling context) triple to a
//! tagged [`LookupResult`]. It never raises: the caller decides whether
//! `MethodNotFound` is fatal or has a fallback.

use super::ExecutionContext;
use crate::func::{Callee, NativeFunc};
use crate::object::{
    Class, MethodEntry, ObjectRef, CTOR_NAME, MAGIC_CALL_NAME, MAGIC_CALL_STATIC_NAME,
};
use crate::stack::CallSubject;
use crate::value::Value;
use crate::{VmError, VmResult};
use std::rc::Rc;
use strata_bytecode::Visibility;

/// Outcome of method resolution
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// Instance method; bind `$this`
    MethodFoundWithThis(Callee),
    /// Static method, or instance method without a compatible `$this`
    MethodFoundNoThis(Callee),
    /// No direct match; the class's `__call` handles it
    MagicCallFound(Callee),
    /// No direct match; the class's `__callStatic` handles it
    MagicCallStaticFound(Callee),
    /// No candidate
    MethodNotFound,
}

/// Kind of call site being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// `Class::method()`
    ClsMethod,
    /// `$obj->method()`
    ObjMethod,
    /// `new Class()`
    CtorMethod,
}

/// Capabilities a class exposes to resolution, tried in order
pub trait MethodSource {
    /// A method declared on the class or inherited
    fn direct_method(&self, name: &str) -> Option<&MethodEntry>;
    /// The instance catch-all, if any
    fn magic_call(&self) -> Option<&MethodEntry>;
    /// The static catch-all, if any
    fn magic_call_static(&self) -> Option<&MethodEntry>;
}

impl MethodSource for Class {
    fn direct_method(&self, name: &str) -> Option<&MethodEntry> {
        self.find_method(name)
    }

    fn magic_call(&self) -> Option<&MethodEntry> {
        self.find_method(MAGIC_CALL_NAME)
    }

    fn magic_call_static(&self) -> Option<&MethodEntry> {
        self.find_method(MAGIC_CALL_STATIC_NAME)
    }
}

fn default_ctor(
    ctx: &mut ExecutionContext,
    this: Option<&ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    if !args.is_empty() {
        let class = this.map(|o| o.borrow().class.name.to_string()).unwrap_or_default();
        ctx.raise_warning(&format!(
            "{} has no constructor; {} argument(s) ignored",
            class,
            args.len()
        ))?;
    }
    Ok(Value::Null)
}

impl ExecutionContext {
    /// Check member access from a calling context class
    pub(crate) fn is_accessible(&self, method: &MethodEntry, ctx: Option<&Class>) -> bool {
        match method.visibility {
            Visibility::Public => true,
            Visibility::Private => ctx.is_some_and(|c| c.id == method.declaring),
            Visibility::Protected => ctx.is_some_and(|c| {
                c.is_subclass_of(method.declaring)
                    || self
                        .classes
                        .get(method.declaring)
                        .is_some_and(|d| d.is_subclass_of(c.id))
            }),
        }
    }

    /// Find an accessible method for a call site
    ///
    /// A private method of the context class shadows same-named methods of
    /// its subclasses. Returns `None` for missing and inaccessible methods.
    pub fn lookup_method_ctx<'c>(
        &self,
        cls: &'c Class,
        name: &str,
        ctx: Option<&'c Class>,
        call_type: CallType,
    ) -> Option<&'c MethodEntry> {
        if call_type == CallType::CtorMethod {
            return cls.constructor().filter(|m| self.is_accessible(m, ctx));
        }
        if let Some(ctx) = ctx {
            if cls.is_subclass_of(ctx.id) {
                if let Some(m) = ctx.own_method(name) {
                    if m.visibility == Visibility::Private {
                        return Some(m);
                    }
                }
            }
        }
        cls.direct_method(name).filter(|m| self.is_accessible(m, ctx))
    }

    /// Resolve `$obj->name()`
    pub fn lookup_obj_method(&self, cls: &Class, name: &str, ctx: Option<&Class>) -> LookupResult {
        match self.lookup_method_ctx(cls, name, ctx, CallType::ObjMethod) {
            Some(m) if m.is_static => LookupResult::MethodFoundNoThis(m.callee.clone()),
            Some(m) => LookupResult::MethodFoundWithThis(m.callee.clone()),
            None => match cls.magic_call() {
                Some(magic) => LookupResult::MagicCallFound(magic.callee.clone()),
                None => LookupResult::MethodNotFound,
            },
        }
    }

    /// Resolve `Class::name()`, binding `$this` when the caller's `$this` is
    /// an instance of the class
    pub fn lookup_cls_method(
        &self,
        cls: &Class,
        name: &str,
        this: Option<&ObjectRef>,
        ctx: Option<&Class>,
    ) -> LookupResult {
        let this_ok = this.is_some_and(|o| o.borrow().instance_of(cls.id));
        match self.lookup_method_ctx(cls, name, ctx, CallType::ClsMethod) {
            Some(m) if !m.is_static && this_ok => {
                LookupResult::MethodFoundWithThis(m.callee.clone())
            }
            Some(m) => LookupResult::MethodFoundNoThis(m.callee.clone()),
            None => {
                if this_ok {
                    if let Some(magic) = cls.magic_call() {
                        return LookupResult::MagicCallFound(magic.callee.clone());
                    }
                }
                match cls.magic_call_static() {
                    Some(magic) => LookupResult::MagicCallStaticFound(magic.callee.clone()),
                    None => LookupResult::MethodNotFound,
                }
            }
        }
    }

    /// Resolve the constructor of `cls`
    ///
    /// A class without a constructor resolves to a default one that accepts
    /// no arguments; only an inaccessible constructor is `MethodNotFound`.
    pub fn lookup_ctor_method(&self, cls: &Class, ctx: Option<&Class>) -> LookupResult {
        match self.lookup_method_ctx(cls, CTOR_NAME, ctx, CallType::CtorMethod) {
            Some(m) => LookupResult::MethodFoundWithThis(m.callee.clone()),
            None if cls.constructor().is_none() => {
                LookupResult::MethodFoundWithThis(Callee::Native(NativeFunc {
                    name: Rc::from(CTOR_NAME),
                    call: default_ctor,
                }))
            }
            None => LookupResult::MethodNotFound,
        }
    }

    /// Error for a failed lookup: inaccessible methods are recoverable,
    /// missing ones are not
    pub(crate) fn method_lookup_error(&self, cls: &Class, name: &str, ctx: Option<&Class>) -> VmError {
        match cls.find_method(name) {
            Some(m) => VmError::RuntimeError(format!(
                "Call to {} method {}::{}() from {}",
                visibility_name(m.visibility),
                cls.name,
                name,
                ctx.map_or_else(|| "global scope".to_string(), |c| format!("scope {}", c.name))
            )),
            None => VmError::MethodNotFound {
                class: cls.name.to_string(),
                method: name.to_string(),
            },
        }
    }

    /// Allocate an instance and run property initializers, without calling
    /// a constructor
    pub fn create_object_only(&self, cls: &Rc<Class>) -> ObjectRef {
        let obj = cls.instantiate();
        if cls.is_subclass_of(self.classes.builtins.exception) {
            if let Some(info) = self.get_caller_info() {
                let mut o = obj.borrow_mut();
                o.set_prop("file", Value::Str(info.file));
                o.set_prop("line", Value::Int(i64::from(info.line)));
            }
        }
        obj
    }

    /// Allocate an instance and run its constructor
    ///
    /// # Errors
    ///
    /// - `VmError::ClassNotFound` if `class` is undefined
    /// - Errors from an inaccessible or failing constructor
    pub fn create_object(&mut self, class: &str, args: &[Value]) -> VmResult<ObjectRef> {
        let cls = self.classes.require(class)?;
        let obj = self.create_object_only(&cls);
        let ctx = self.get_context_class();
        let callee = match self.lookup_ctor_method(&cls, ctx.as_deref()) {
            LookupResult::MethodFoundWithThis(callee) => callee,
            _ => return Err(self.method_lookup_error(&cls, CTOR_NAME, ctx.as_deref())),
        };
        let call = super::CallCtx {
            callee,
            subject: CallSubject::Object(Rc::clone(&obj)),
            inv_name: None,
        };
        self.invoke_func(&call, args, None, super::InvokeFlags::Normal)?;
        Ok(obj)
    }

    /// Resolve a class constant
    ///
    /// # Errors
    ///
    /// - `VmError::ClassNotFound` if the class is undefined
    /// - `VmError::ConstantNotFound` if the constant is undefined
    /// - `VmError::Fatal` if the constant holds an array or object
    pub fn lookup_cls_cns(&self, class: &str, name: &str) -> VmResult<Value> {
        let cls = self.classes.require(class)?;
        let value = cls.constant(name).ok_or_else(|| VmError::ConstantNotFound {
            class: class.to_string(),
            constant: name.to_string(),
        })?;
        if value.is_refcounted_container() {
            return Err(VmError::Fatal(format!(
                "class constant {}::{} holds a container",
                class, name
            )));
        }
        Ok(value.clone())
    }

    /// Look up a class by name
    pub fn lookup_class(&self, name: &str) -> Option<Rc<Class>> {
        self.classes.get_by_name(name).cloned()
    }
}

fn visibility_name(v: Visibility) -> &'static str {
    match v {
        Visibility::Public => "public",
        Visibility::Protected => "protected",
        Visibility::Private => "private",
    }
}
