//! Application-level argument and result values.
//!
//! [`Value`] mirrors the wire value set but carries live capabilities: local
//! objects to be exported, and [`RemoteReference`]s received from peers.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{connection::RemoteReference, referenceable::Referenceable};

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A local object; exported to the peer when sent.
    Local(Arc<dyn Referenceable>),
    /// A capability held on some peer.
    Remote(RemoteReference),
}

impl Value {
    /// Wraps a concrete local object.
    pub fn local<T: Referenceable + 'static>(object: Arc<T>) -> Self {
        Value::Local(object)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteReference> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_remote(self) -> Option<RemoteReference> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

fn same_object(a: &Arc<dyn Referenceable>, b: &Arc<dyn Referenceable>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Local(a), Value::Local(b)) => same_object(a, b),
            (Value::Remote(a), Value::Remote(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Text(s) => write!(f, "Text({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Local(object) => write!(f, "Local({:?})", object.metadata().interface),
            Value::Remote(r) => write!(f, "Remote({r:?})"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<RemoteReference> for Value {
    fn from(r: RemoteReference) -> Self {
        Value::Remote(r)
    }
}

impl From<Arc<dyn Referenceable>> for Value {
    fn from(object: Arc<dyn Referenceable>) -> Self {
        Value::Local(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::referenceable::FnTarget;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from(7).as_int(), Some(7));
        assert_eq!(Value::from(7).as_float(), Some(7.0));
        assert_eq!(Value::from("x").as_text(), Some("x"));
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert!(Value::from(true).as_int().is_none());
        assert!(Value::None.is_none());
    }

    #[test]
    fn test_local_objects_compare_by_identity() {
        let a: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, _, _| Ok(Value::None)));
        let b: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, _, _| Ok(Value::None)));
        assert_eq!(Value::Local(a.clone()), Value::Local(a.clone()));
        assert_ne!(Value::Local(a), Value::Local(b));
    }
}
