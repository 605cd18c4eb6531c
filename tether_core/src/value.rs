//! Runtime value model.
//!
//! A self-describing tree in the shape of a JSON document, extended with two
//! live-object variants: [`Value::Object`] carries a local shareable that
//! will cross the wire as a reference we own, [`Value::Proxy`] carries a
//! peer-owned reference. The serializer translates both at encode/decode
//! time; everything else travels by value.

use std::fmt;
use std::sync::Arc;

use crate::binder::{ProxyObject, ShareableObject};

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    /// A local shareable: marshaled as a reference into our held table.
    Object(Arc<dyn ShareableObject>),
    /// A peer-owned reference: marshaled back as the owner's id.
    Proxy(Arc<dyn ProxyObject>),
}

/// Allocation identity of a trait-object `Arc`, ignoring the vtable half of
/// the pointer.
pub(crate) fn object_identity(obj: &Arc<dyn ShareableObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Arc<dyn ShareableObject>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<Arc<dyn ProxyObject>> {
        match self {
            Value::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Live objects compare by allocation identity.
            (Value::Object(a), Value::Object(b)) => object_identity(a) == object_identity(b),
            (Value::Proxy(a), Value::Proxy(b)) => {
                Arc::as_ptr(a) as *const () as usize == Arc::as_ptr(b) as *const () as usize
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Value::Object(obj) => write!(f, "Object({})", obj.interface()),
            Value::Proxy(proxy) => write!(f, "Proxy({})", proxy.grip().interface()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
