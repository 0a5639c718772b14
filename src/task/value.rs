//! Input binding values.
//!
//! A binding is either a scalar or a sequence of values. Sequences may nest,
//! which is how command-of-commands executables such as
//! `["pwd", "ls", ["echo", "hi"]]` are expressed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered name → value mapping, in declaration order
pub type Bindings = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(Scalar),
    Sequence(Vec<Value>),
}

/// Structural shape of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Sequence,
    NestedSequence,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Sequence(items) if items.iter().any(|v| matches!(v, Value::Sequence(_))) => {
                ValueKind::NestedSequence
            }
            Value::Sequence(_) => ValueKind::Sequence,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            Value::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            Value::Sequence(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Depth-first rendering of every scalar, one string per leaf
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<String>) {
        match self {
            Value::Scalar(s) => out.push(s.to_string()),
            Value::Sequence(items) => {
                for item in items {
                    item.collect_leaves(out);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => write!(f, "{}", s),
            Value::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::Str(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::Str(s))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Scalar(Scalar::Int(i as i64))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(Scalar::Float(x))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_detection() {
        assert_eq!(Value::from("pwd").kind(), ValueKind::Scalar);
        assert_eq!(Value::from(vec!["pwd", "ls"]).kind(), ValueKind::Sequence);

        let nested = Value::Sequence(vec![
            Value::from("pwd"),
            Value::from(vec!["echo", "hi"]),
        ]);
        assert_eq!(nested.kind(), ValueKind::NestedSequence);
        assert_eq!(nested.flatten(), vec!["pwd", "echo", "hi"]);
    }

    #[test]
    fn test_untagged_deserialization() {
        let value: Value = serde_json::from_str(r#"["pwd", 3, true, ["echo", "hi"], 1.5]"#).unwrap();
        let items = value.as_sequence().unwrap();
        assert_eq!(items[0], Value::from("pwd"));
        assert_eq!(items[1], Value::from(3i64));
        assert_eq!(items[2], Value::from(true));
        assert_eq!(items[3].kind(), ValueKind::Sequence);
        assert_eq!(items[4], Value::from(1.5));
    }

    #[test]
    fn test_display() {
        let value = Value::Sequence(vec![Value::from("a"), Value::from(vec![1i64, 2])]);
        assert_eq!(value.to_string(), "[a, [1, 2]]");
    }
}
