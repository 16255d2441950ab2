//! Opaque values exchanged between operation bodies and the scheduler

use crate::error::ValueError;
use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value produced or consumed by an operation body.
///
/// The scheduler never interprets values beyond measuring their size for
/// bus transit and comparing instance variables in permission guards.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value (result of an operation returning nothing)
    #[default]
    Void,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Real number
    Real(f64),
    /// Text
    Text(String),
    /// Sequence of values
    Seq(Vec<Value>),
    /// Reference to a deployed object
    #[serde(skip_deserializing)]
    Object(ObjectId),
}

impl Value {
    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Seq(_) => "seq",
            Value::Object(_) => "object",
        }
    }

    /// Check if this is the void value
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Get as integer
    pub fn as_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(ValueError::TypeMismatch {
                expected: "int",
                found: other.type_name(),
            }),
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ValueError::TypeMismatch {
                expected: "bool",
                found: other.type_name(),
            }),
        }
    }

    /// Add `delta` to an integer value. Void counts as zero, so counters
    /// can be incremented before they are first written.
    pub fn add_int(&self, delta: i64) -> Result<Value, ValueError> {
        let current = match self {
            Value::Void => 0,
            other => other.as_int()?,
        };
        current
            .checked_add(delta)
            .map(Value::Int)
            .ok_or(ValueError::Overflow)
    }

    /// Number of scalar leaves, used as the message size on a bus
    pub fn size(&self) -> u64 {
        match self {
            Value::Void => 0,
            Value::Seq(items) => items.iter().map(Value::size).sum(),
            _ => 1,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
