//! Composable filter expressions over entity fields.
//!
//! # Responsibility
//! - Represent filters as an immutable expression tree.
//! - Build filters either structurally or from a format-style template.
//! - Evaluate filters against stored JSON payloads.
//!
//! # Invariants
//! - Every construction error surfaces before evaluation; evaluation is total.
//! - Template arguments are bound as typed values, never spliced into text.

mod template;

use crate::model::value::{Ordinal, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::ops::Not;

static KEY_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("valid key path regex")
});

pub type PredicateResult<T> = Result<T, InvalidPredicateError>;

/// Construction-time predicate error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidPredicateError {
    /// Template placeholders and supplied arguments disagree in number.
    ArgumentCount { expected: usize, supplied: usize },
    /// Argument at `index` (zero-based) has the wrong kind for its position.
    ArgumentType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    /// Key path is empty or not a dotted identifier.
    InvalidKeyPath(String),
    /// Template could not be parsed.
    Syntax { offset: usize, message: String },
    /// Comparison option other than `[c]`.
    UnsupportedOption(String),
}

impl Display for InvalidPredicateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArgumentCount { expected, supplied } => write!(
                f,
                "predicate template expects {expected} argument(s), got {supplied}"
            ),
            Self::ArgumentType {
                index,
                expected,
                found,
            } => write!(
                f,
                "predicate argument {index} must be {expected}, got {found}"
            ),
            Self::InvalidKeyPath(path) => write!(f, "invalid predicate key path `{path}`"),
            Self::Syntax { offset, message } => {
                write!(f, "predicate syntax error at offset {offset}: {message}")
            }
            Self::UnsupportedOption(option) => {
                write!(f, "unsupported comparison option `[{option}]`")
            }
        }
    }
}

impl Error for InvalidPredicateError {}

/// Dotted path into an entity's fields, e.g. `author.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn parse(path: &str) -> PredicateResult<Self> {
        let trimmed = path.trim();
        if !KEY_PATH_RE.is_match(trimmed) {
            return Err(InvalidPredicateError::InvalidKeyPath(path.to_string()));
        }
        Ok(Self(trimmed.split('.').map(str::to_string).collect()))
    }

    /// Resolves this path inside `fields`; missing segments resolve to `Null`.
    pub(crate) fn resolve(&self, fields: &JsonValue) -> Option<Value> {
        let mut current = fields;
        for segment in &self.0 {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Some(Value::Null),
            }
        }
        Value::from_json(current)
    }
}

impl Display for KeyPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Comparison operator of a single field test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    /// Substring test on text, element test on lists.
    Contains,
    BeginsWith,
    EndsWith,
    /// Field equals one element of a list operand.
    In,
}

impl ComparisonOp {
    /// Returns the operand kind this operator requires, or `None` when `value` fits.
    pub(crate) fn operand_mismatch(self, value: &Value) -> Option<&'static str> {
        let fits = match self {
            Self::Equal | Self::NotEqual => true,
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual => {
                value.is_orderable()
            }
            Self::Contains => !matches!(value, Value::Null | Value::List(_)),
            Self::BeginsWith | Self::EndsWith => matches!(value, Value::Text(_)),
            Self::In => matches!(value, Value::List(_)),
        };
        if fits {
            return None;
        }
        Some(match self {
            Self::Equal | Self::NotEqual => "any value",
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual => {
                "a number or text"
            }
            Self::Contains => "a scalar value",
            Self::BeginsWith | Self::EndsWith => "text",
            Self::In => "a list",
        })
    }
}

/// One `key <op> value` test.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub key: KeyPath,
    pub op: ComparisonOp,
    pub value: Value,
    pub case_insensitive: bool,
}

impl Comparison {
    fn evaluate(&self, fields: &JsonValue) -> bool {
        let Some(field) = self.key.resolve(fields) else {
            return self.op == ComparisonOp::NotEqual;
        };
        let ci = self.case_insensitive;
        match self.op {
            ComparisonOp::Equal => field.matches(&self.value, ci),
            ComparisonOp::NotEqual => !field.matches(&self.value, ci),
            ComparisonOp::Less => field.compare(&self.value, ci) == Some(Ordering::Less),
            ComparisonOp::LessOrEqual => matches!(
                field.compare(&self.value, ci),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ComparisonOp::Greater => field.compare(&self.value, ci) == Some(Ordering::Greater),
            ComparisonOp::GreaterOrEqual => matches!(
                field.compare(&self.value, ci),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ComparisonOp::Contains => match (&field, &self.value) {
                (Value::Text(haystack), Value::Text(needle)) => {
                    text_test(haystack, needle, ci, |h, n| h.contains(n))
                }
                (Value::List(items), needle) => items.iter().any(|item| item.matches(needle, ci)),
                _ => false,
            },
            ComparisonOp::BeginsWith => match (field.as_text(), self.value.as_text()) {
                (Some(haystack), Some(prefix)) => {
                    text_test(haystack, prefix, ci, |h, p| h.starts_with(p))
                }
                _ => false,
            },
            ComparisonOp::EndsWith => match (field.as_text(), self.value.as_text()) {
                (Some(haystack), Some(suffix)) => {
                    text_test(haystack, suffix, ci, |h, s| h.ends_with(s))
                }
                _ => false,
            },
            ComparisonOp::In => match &self.value {
                Value::List(options) => options.iter().any(|option| field.matches(option, ci)),
                _ => false,
            },
        }
    }
}

fn ordinal_value(value: impl Into<Ordinal>) -> Value {
    let ordinal: Ordinal = value.into();
    ordinal.into()
}

fn text_test(haystack: &str, needle: &str, ci: bool, test: impl Fn(&str, &str) -> bool) -> bool {
    if ci {
        test(&haystack.to_lowercase(), &needle.to_lowercase())
    } else {
        test(haystack, needle)
    }
}

/// Immutable, reusable filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Constant(bool),
    Compare(Comparison),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Matches every entity.
    pub fn always() -> Self {
        Self::Constant(true)
    }

    /// Matches no entity.
    pub fn never() -> Self {
        Self::Constant(false)
    }

    /// Starts a structured comparison on `path`.
    pub fn key(path: &str) -> PredicateResult<KeyExpr> {
        Ok(KeyExpr {
            key: KeyPath::parse(path)?,
            case_insensitive: false,
        })
    }

    /// Parses a format-style template, binding `args` to its placeholders in order.
    ///
    /// Fails on wrong argument count or kinds, unknown syntax, or bad key paths.
    pub fn format(template: &str, args: Vec<Value>) -> PredicateResult<Self> {
        template::parse(template, args)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Conjunction of all parts; empty input matches everything.
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Self {
        Self::And(parts.into_iter().collect())
    }

    /// Disjunction of all parts; empty input matches nothing.
    pub fn any_of(parts: impl IntoIterator<Item = Predicate>) -> Self {
        Self::Or(parts.into_iter().collect())
    }

    /// Evaluates this predicate against one entity's JSON fields.
    pub fn evaluate(&self, fields: &JsonValue) -> bool {
        match self {
            Self::Constant(result) => *result,
            Self::Compare(comparison) => comparison.evaluate(fields),
            Self::And(parts) => parts.iter().all(|part| part.evaluate(fields)),
            Self::Or(parts) => parts.iter().any(|part| part.evaluate(fields)),
            Self::Not(inner) => !inner.evaluate(fields),
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

/// Key half of a structured comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyExpr {
    key: KeyPath,
    case_insensitive: bool,
}

impl KeyExpr {
    /// Makes text comparisons fold case, like the `[c]` template option.
    pub fn ignoring_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.build(ComparisonOp::Equal, value.into())
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.build(ComparisonOp::NotEqual, value.into())
    }

    pub fn is_null(self) -> Predicate {
        self.build(ComparisonOp::Equal, Value::Null)
    }

    pub fn lt(self, value: impl Into<Ordinal>) -> Predicate {
        self.build(ComparisonOp::Less, ordinal_value(value))
    }

    pub fn le(self, value: impl Into<Ordinal>) -> Predicate {
        self.build(ComparisonOp::LessOrEqual, ordinal_value(value))
    }

    pub fn gt(self, value: impl Into<Ordinal>) -> Predicate {
        self.build(ComparisonOp::Greater, ordinal_value(value))
    }

    pub fn ge(self, value: impl Into<Ordinal>) -> Predicate {
        self.build(ComparisonOp::GreaterOrEqual, ordinal_value(value))
    }

    /// Substring test on text fields, element test on list fields.
    pub fn contains(self, value: impl Into<Ordinal>) -> Predicate {
        self.build(ComparisonOp::Contains, ordinal_value(value))
    }

    pub fn begins_with(self, prefix: impl Into<String>) -> Predicate {
        self.build(ComparisonOp::BeginsWith, Value::Text(prefix.into()))
    }

    pub fn ends_with(self, suffix: impl Into<String>) -> Predicate {
        self.build(ComparisonOp::EndsWith, Value::Text(suffix.into()))
    }

    pub fn one_of<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Predicate {
        let options = values.into_iter().map(Into::into).collect();
        self.build(ComparisonOp::In, Value::List(options))
    }

    // Operand kinds are fixed by the method signatures above.
    fn build(self, op: ComparisonOp, value: Value) -> Predicate {
        Predicate::Compare(Comparison {
            key: self.key,
            op,
            value,
            case_insensitive: self.case_insensitive,
        })
    }
}

/// Builds a [`Predicate`] from a template and positional arguments.
///
/// ```
/// use forumstore_core::predicate;
/// use serde_json::json;
///
/// let unread = predicate!("forum_id == %@ AND unread_posts > %d", "261", 0).unwrap();
/// assert!(unread.evaluate(&json!({"forum_id": "261", "unread_posts": 4})));
/// ```
#[macro_export]
macro_rules! predicate {
    ($template:expr $(, $arg:expr)* $(,)?) => {
        $crate::Predicate::format(
            $template,
            ::std::vec![$($crate::Value::from($arg)),*],
        )
    };
}
