//! Guest values
//!
//! Scalars are stored inline; strings, arrays and objects are reference
//! counted. Dropping the last [`Value`] holding a reference releases it
//! immediately, which is what makes frame teardown deterministic.

use crate::object::ObjectRef;
use crate::{VmError, VmResult};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use strata_bytecode::Constant;

/// Shared handle to a guest array
pub type ArrayRef = Rc<RefCell<Array>>;

/// A guest value
#[derive(Clone, Default)]
pub enum Value {
    /// `null`
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Double(f64),
    /// Immutable string
    Str(Rc<str>),
    /// Ordered hash map
    Array(ArrayRef),
    /// Class instance
    Object(ObjectRef),
}

/// Array key: integers and strings only
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    /// Integer key
    Int(i64),
    /// String key
    Str(Rc<str>),
}

impl ArrayKey {
    /// Convert the key back to a value
    pub fn to_value(&self) -> Value {
        match self {
            ArrayKey::Int(i) => Value::Int(*i),
            ArrayKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Insertion-ordered guest array
#[derive(Debug, Clone)]
pub struct Array {
    entries: IndexMap<ArrayKey, Value>,
    /// `None` once `i64::MAX` has been used as a key
    next_index: Option<i64>,
}

impl Default for Array {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            next_index: Some(0),
        }
    }
}

impl Array {
    /// Create an empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list from values, keyed 0..n
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let mut array = Self::new();
        for v in values {
            array.append(v);
        }
        array
    }

    /// Wrap into a shared handle
    pub fn into_ref(self) -> ArrayRef {
        Rc::new(RefCell::new(self))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check for no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append with the next integer key
    ///
    /// Returns `false`, leaving the array untouched, when the integer key
    /// space is exhausted.
    pub fn append(&mut self, value: Value) -> bool {
        let Some(key) = self.next_index else {
            return false;
        };
        self.next_index = key.checked_add(1);
        self.entries.insert(ArrayKey::Int(key), value);
        true
    }

    /// Insert or replace a keyed entry
    pub fn insert(&mut self, key: ArrayKey, value: Value) {
        if let ArrayKey::Int(i) = key {
            if self.next_index.is_some_and(|next| i >= next) {
                self.next_index = i.checked_add(1);
            }
        }
        self.entries.insert(key, value);
    }

    /// Look up an entry by key
    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Look up a string-keyed entry
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&ArrayKey::Str(Rc::from(key)))
    }

    /// Entry at an iteration position
    pub fn get_index(&self, pos: usize) -> Option<(&ArrayKey, &Value)> {
        self.entries.get_index(pos)
    }

    /// Iterate over values in order
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }
}

impl Value {
    /// Create a string value
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    /// Create a list value
    pub fn list(values: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Array::from_values(values).into_ref())
    }

    /// Name of the value's type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Check for `null`
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Arrays and objects are reference-counted containers
    #[inline]
    pub fn is_refcounted_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Array payload
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Object payload
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Truthiness
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
            Value::Str(s) => !(s.is_empty() || &**s == "0"),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Numeric view used by arithmetic; `None` for non-numeric values
    pub fn to_number(&self) -> Option<Value> {
        match self {
            Value::Null => Some(Value::Int(0)),
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::Int(_) | Value::Double(_) => Some(self.clone()),
            Value::Str(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Some(Value::Int(i))
                } else {
                    t.parse::<f64>().ok().map(Value::Double)
                }
            }
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Integer conversion (non-numeric values become 0)
    pub fn to_int(&self) -> i64 {
        match self.to_number() {
            Some(Value::Int(i)) => i,
            Some(Value::Double(d)) => d as i64,
            _ => 0,
        }
    }

    /// String conversion
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) => {
                if d.fract() == 0.0 && d.is_finite() && d.abs() < 1e15 {
                    format!("{}", *d as i64)
                } else {
                    d.to_string()
                }
            }
            Value::Str(s) => s.to_string(),
            Value::Array(_) => "Array".to_string(),
            Value::Object(o) => o.borrow().class.name.to_string(),
        }
    }

    /// Convert to an array key
    ///
    /// # Errors
    ///
    /// Returns `VmError::TypeError` for containers.
    pub fn to_array_key(&self) -> VmResult<ArrayKey> {
        match self {
            Value::Int(i) => Ok(ArrayKey::Int(*i)),
            Value::Str(s) => match s.parse::<i64>() {
                Ok(i) if i.to_string() == **s => Ok(ArrayKey::Int(i)),
                _ => Ok(ArrayKey::Str(s.clone())),
            },
            Value::Bool(b) => Ok(ArrayKey::Int(i64::from(*b))),
            Value::Double(d) => Ok(ArrayKey::Int(*d as i64)),
            Value::Null => Ok(ArrayKey::Str(Rc::from(""))),
            Value::Array(_) | Value::Object(_) => Err(VmError::TypeError(format!(
                "Illegal offset type: {}",
                self.type_name()
            ))),
        }
    }

    /// Strict identity (`===`)
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Loose equality (`==`)
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Null, Value::Str(s)) | (Value::Str(s), Value::Null) => s.is_empty(),
            (Value::Bool(b), v) | (v, Value::Bool(b)) => *b == v.to_bool(),
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || {
                    let (a, b) = (a.borrow(), b.borrow());
                    a.len() == b.len()
                        && a.entries
                            .iter()
                            .all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
                }
            }
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Ordering used by the relational opcodes
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => {
                match (self.to_number(), other.to_number()) {
                    (Some(x), Some(y)) => x.compare(&y),
                    _ => Some(a.cmp(b)),
                }
            }
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.to_number()?;
                let b = other.to_number()?;
                match (a, b) {
                    (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
                    (x, y) => as_f64(&x).partial_cmp(&as_f64(&y)),
                }
            }
        }
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Double(d) => *d,
        _ => 0.0,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

impl From<&Constant> for Value {
    fn from(c: &Constant) -> Self {
        match c {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Double(d) => Value::Double(*d),
            Constant::Str(s) => Value::str(s),
        }
    }
}

// Containers print shallowly; objects may reference themselves.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Double(d) => write!(f, "Double({})", d),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Array(a) => write!(f, "Array(len={})", a.borrow().len()),
            Value::Object(o) => match o.try_borrow() {
                Ok(obj) => write!(f, "Object({})", obj.class.name),
                Err(_) => write!(f, "Object(<borrowed>)"),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Value::Object(o) = self {
            if let Ok(obj) = o.try_borrow() {
                return match obj.get_prop("message") {
                    Some(msg) => write!(f, "{}: {}", obj.class.name, msg.to_display_string()),
                    None => write!(f, "{}", obj.class.name),
                };
            }
        }
        f.write_str(&self.to_display_string())
    }
}
