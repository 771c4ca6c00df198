//! Attribute values
//!
//! A `Value` is the payload stored under an attribute, either directly in a
//! snapshot record or inside a context-tree node.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::AttrType;

/// A typed telemetry value
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Empty,
    Str(Arc<str>),
    Uint(u64),
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// Hashable identity of a value, used to intern context-tree nodes.
///
/// Doubles compare by bit pattern so that `NaN` interns consistently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ValueKey {
    Empty,
    Str(Arc<str>),
    Uint(u64),
    Int(i64),
    Double(u64),
    Bool(bool),
}

impl Value {
    /// Type of the value
    #[must_use]
    pub fn attr_type(&self) -> AttrType {
        match self {
            Value::Empty => AttrType::Invalid,
            Value::Str(_) => AttrType::Str,
            Value::Uint(_) => AttrType::Uint,
            Value::Int(_) => AttrType::Int,
            Value::Double(_) => AttrType::Double,
            Value::Bool(_) => AttrType::Bool,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Unsigned view of integer values
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            Value::Bool(v) => Some(u64::from(v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn key(&self) -> ValueKey {
        match self {
            Value::Empty => ValueKey::Empty,
            Value::Str(s) => ValueKey::Str(Arc::clone(s)),
            Value::Uint(v) => ValueKey::Uint(*v),
            Value::Int(v) => ValueKey::Int(*v),
            Value::Double(v) => ValueKey::Double(v.to_bits()),
            Value::Bool(v) => ValueKey::Bool(*v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Str(s) => f.write_str(s),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(u64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert_eq!(Value::from("matmul").attr_type(), AttrType::Str);
        assert_eq!(Value::from(500u64).attr_type(), AttrType::Uint);
        assert_eq!(Value::from(-1i32).attr_type(), AttrType::Int);
        assert_eq!(Value::Empty.attr_type(), AttrType::Invalid);
    }

    #[test]
    fn test_double_key_uses_bits() {
        assert_eq!(Value::Double(f64::NAN).key(), Value::Double(f64::NAN).key());
        assert_ne!(Value::Double(0.0).key(), Value::Double(-0.0).key());
    }

    #[test]
    fn test_display_and_accessors() {
        assert_eq!(Value::from("a").to_string(), "a");
        assert_eq!(Value::from(2.5).to_string(), "2.5");
        assert_eq!(Value::Int(-3).as_u64(), None);
        assert_eq!(Value::Uint(7).as_u64(), Some(7));
        assert_eq!(Value::from("x").as_str(), Some("x"));
    }
}
