//! Searchable fields.
//!
//! Each entity type exposes an enum of the fields a query may compare. The
//! entity answers with the current [`FieldValue`] for in-memory evaluation,
//! and the field describes where it lives in the serialized document
//! ([`FieldPath`]) for backends that query the stored form.

use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// A comparable scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Integer (timestamps are epoch milliseconds).
    Int(i64),
    /// String.
    Str(String),
}

impl Value {
    /// The string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is one.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Str(_) => 2,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Current value of a field on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Field not set.
    Absent,
    /// Single-valued field.
    One(Value),
    /// Multi-valued field; matches when any element matches.
    Many(Vec<Value>),
}

impl FieldValue {
    /// From an optional string.
    #[must_use]
    pub fn from_opt(value: Option<&str>) -> Self {
        value.map_or(Self::Absent, |v| Self::One(Value::from(v)))
    }

    /// From a collection of strings. An empty collection is absent.
    pub fn from_strs<'a>(values: impl IntoIterator<Item = &'a String>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Value::from).collect();
        if values.is_empty() {
            Self::Absent
        } else {
            Self::Many(values)
        }
    }

    /// True when the field carries at least one value.
    #[must_use]
    pub fn is_present(&self) -> bool {
        match self {
            Self::Absent => false,
            Self::One(_) => true,
            Self::Many(values) => !values.is_empty(),
        }
    }

    /// All values as a slice.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Absent => &[],
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }

    /// Value used for ordering: the single value or the smallest element.
    #[must_use]
    pub fn sort_key(&self) -> Option<&Value> {
        self.values().iter().min()
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::One(Value::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::One(Value::Int(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::One(Value::Bool(value))
    }
}

/// Where a field lives in the serialized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath {
    /// Top-level scalar.
    Scalar(&'static str),
    /// Top-level array of scalars.
    Array(&'static str),
    /// Object of key to array of strings; the key is the first comparison argument.
    MultiMap(&'static str),
    /// Object of key to string; the key is the first comparison argument.
    Map(&'static str),
    /// Keys of a top-level object.
    MapKeys(&'static str),
    /// One scalar property of each element of a top-level array of objects.
    Nested(&'static str, &'static str),
}

/// A field a query may compare.
pub trait SearchableField: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Field name for logs and errors.
    fn name(&self) -> &'static str;

    /// Number of leading comparison arguments naming a key, e.g. the
    /// attribute name.
    fn key_arity(&self) -> usize {
        0
    }

    /// Location in the serialized entity.
    fn path(&self) -> FieldPath;
}

/// An entity whose fields a query can inspect.
pub trait SearchableEntity: Entity {
    /// The field enum.
    type Field: SearchableField;

    /// Current value of `field`; `keys` holds the leading key arguments.
    fn field_value(&self, field: Self::Field, keys: &[Value]) -> FieldValue;
}

/// Shared lookup for `MultiMap` attribute fields.
#[must_use]
pub fn attribute_value<E: Entity>(entity: &E, keys: &[Value]) -> FieldValue {
    keys.first()
        .and_then(Value::as_str)
        .map_or(FieldValue::Absent, |name| {
            FieldValue::from_strs(entity.attribute(name))
        })
}
