//! Typed operand values and their comparison rules against stored fields.
//!
//! # Invariants
//! - Integers and reals compare numerically with each other.
//! - Text compares lexically; case folding is opt-in per comparison.
//! - Values of different kinds never compare equal and have no ordering.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Operand of a predicate comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Stable kind label used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::List(_) => "list",
        }
    }

    /// Converts a stored JSON field into a comparable value.
    ///
    /// Returns `None` for JSON objects, which no operand can match.
    pub fn from_json(json: &JsonValue) -> Option<Self> {
        let value = match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(flag) => Self::Bool(*flag),
            JsonValue::Number(number) => match number.as_i64() {
                Some(integer) => Self::Integer(integer),
                None => Self::Real(number.as_f64()?),
            },
            JsonValue::String(text) => Self::Text(text.clone()),
            JsonValue::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect::<Option<_>>()?)
            }
            JsonValue::Object(_) => return None,
        };
        Some(value)
    }

    pub(crate) fn is_orderable(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Real(_) | Self::Text(_))
    }

    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Equality under predicate semantics.
    pub fn matches(&self, other: &Self, case_insensitive: bool) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(left), Self::Bool(right)) => left == right,
            (Self::Integer(left), Self::Integer(right)) => left == right,
            (Self::Text(left), Self::Text(right)) => {
                if case_insensitive {
                    left.to_lowercase() == right.to_lowercase()
                } else {
                    left == right
                }
            }
            (Self::List(left), Self::List(right)) => {
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right)
                        .all(|(l, r)| l.matches(r, case_insensitive))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(left), Some(right)) => left == right,
                _ => false,
            },
        }
    }

    /// Ordering under predicate semantics; `None` when the kinds are not comparable.
    pub fn compare(&self, other: &Self, case_insensitive: bool) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(left), Self::Integer(right)) => Some(left.cmp(right)),
            (Self::Text(left), Self::Text(right)) => {
                if case_insensitive {
                    Some(left.to_lowercase().cmp(&right.to_lowercase()))
                } else {
                    Some(left.cmp(right))
                }
            }
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Total order used for sort descriptors: null < bool < number < text < list.
    pub(crate) fn sort_cmp(&self, other: &Self) -> Ordering {
        self.sort_rank()
            .cmp(&other.sort_rank())
            .then_with(|| match (self, other) {
                (Self::Bool(left), Self::Bool(right)) => left.cmp(right),
                (Self::List(left), Self::List(right)) => left
                    .iter()
                    .zip(right)
                    .map(|(l, r)| l.sort_cmp(r))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or_else(|| left.len().cmp(&right.len())),
                _ => self.compare(other, false).unwrap_or(Ordering::Equal),
            })
    }

    fn sort_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Integer(_) | Self::Real(_) => 2,
            Self::Text(_) => 3,
            Self::List(_) => 4,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Orderable operand accepted by `<`, `<=`, `>`, `>=` and `CONTAINS` builders.
#[derive(Debug, Clone, PartialEq)]
pub enum Ordinal {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<Ordinal> for Value {
    fn from(value: Ordinal) -> Self {
        match value {
            Ordinal::Integer(integer) => Self::Integer(integer),
            Ordinal::Real(real) => Self::Real(real),
            Ordinal::Text(text) => Self::Text(text),
        }
    }
}

impl From<i32> for Ordinal {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for Ordinal {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for Ordinal {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Ordinal {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Ordinal {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Ordinal {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
