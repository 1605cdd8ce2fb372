//! Search criteria.
//!
//! A [`Criteria`] is a backend-neutral boolean tree over the searchable
//! fields of one entity type. The in-memory backends evaluate it with
//! [`Criteria::matches`]; the SQL backend walks [`Criteria::root`] and
//! translates each node.
//!
//! Leaf comparisons carry their arguments in order. Fields with a key arity
//! (attributes, per-key maps) consume the leading arguments as the key; the
//! remaining arguments are the comparison values.

use kc_model::{FieldValue, SearchableEntity, SearchableField, Value};
use regex::Regex;

use crate::error::{StorageError, StorageResult};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal. An absent field is not equal to anything.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Member of the value list.
    In,
    /// Field present.
    Exists,
    /// Field absent.
    NotExists,
    /// Case-sensitive pattern with `%` wildcards.
    Like,
    /// Case-insensitive pattern with `%` wildcards. A double-quoted value is
    /// a case-sensitive exact match.
    ILike,
}

impl Operator {
    /// Number of comparison values the operator takes; `None` for any.
    #[must_use]
    pub const fn value_count(self) -> Option<usize> {
        match self {
            Self::Exists | Self::NotExists => Some(0),
            Self::In => None,
            _ => Some(1),
        }
    }

    /// Operator symbol for logs.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "IN",
            Self::Exists => "EXISTS",
            Self::NotExists => "NOT EXISTS",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
        }
    }
}

/// How a `LIKE`/`ILIKE` value matches.
#[derive(Debug, Clone)]
pub enum LikePattern {
    /// Whole-value comparison.
    Exact {
        /// Value to compare against.
        value: String,
        /// Whether case matters.
        case_sensitive: bool,
    },
    /// Pattern containing `%` wildcards.
    Wildcard {
        /// The original pattern, `%` meaning any run of characters.
        pattern: String,
        /// Whether case matters.
        case_sensitive: bool,
        /// Anchored regex equivalent, `None` if it failed to compile.
        regex: Option<Regex>,
    },
}

impl LikePattern {
    /// Interprets `value` for `op`, which must be `Like` or `ILike`.
    #[must_use]
    pub fn parse(value: &str, op: Operator) -> Self {
        let case_sensitive = op != Operator::ILike;

        if !case_sensitive && value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            return Self::Exact {
                value: value[1..value.len() - 1].to_string(),
                case_sensitive: true,
            };
        }

        if !value.contains('%') {
            return Self::Exact {
                value: value.to_string(),
                case_sensitive,
            };
        }

        let body = value
            .split('%')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let flags = if case_sensitive { "(?s)" } else { "(?is)" };
        let regex = Regex::new(&format!("{flags}^{body}$"))
            .inspect_err(|e| tracing::warn!(pattern = %value, error = %e, "Unusable LIKE pattern"))
            .ok();

        Self::Wildcard {
            pattern: value.to_string(),
            case_sensitive,
            regex,
        }
    }

    /// Whether `candidate` matches.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Exact {
                value,
                case_sensitive: true,
            } => candidate == value,
            Self::Exact {
                value,
                case_sensitive: false,
            } => candidate.to_lowercase() == value.to_lowercase(),
            Self::Wildcard { regex, .. } => regex.as_ref().is_some_and(|r| r.is_match(candidate)),
        }
    }
}

/// One leaf comparison.
#[derive(Debug, Clone)]
pub struct Comparison<F> {
    field: F,
    op: Operator,
    args: Vec<Value>,
    pattern: Option<LikePattern>,
}

impl<F: SearchableField> Comparison<F> {
    fn new(field: F, op: Operator, args: Vec<Value>) -> Self {
        let mut comparison = Self {
            field,
            op,
            args,
            pattern: None,
        };
        if matches!(op, Operator::Like | Operator::ILike) {
            comparison.pattern = comparison
                .values()
                .first()
                .and_then(Value::as_str)
                .map(|v| LikePattern::parse(v, op));
        }
        comparison
    }

    /// The compared field.
    #[must_use]
    pub const fn field(&self) -> F {
        self.field
    }

    /// The operator.
    #[must_use]
    pub const fn op(&self) -> Operator {
        self.op
    }

    /// Leading key arguments.
    #[must_use]
    pub fn keys(&self) -> &[Value] {
        let arity = self.field.key_arity().min(self.args.len());
        &self.args[..arity]
    }

    /// Comparison values following the keys.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        let arity = self.field.key_arity().min(self.args.len());
        &self.args[arity..]
    }

    /// Parsed pattern for `Like` and `ILike`.
    #[must_use]
    pub const fn pattern(&self) -> Option<&LikePattern> {
        self.pattern.as_ref()
    }

    fn validate(&self) -> StorageResult<()> {
        let arity = self.field.key_arity();
        if self.args.len() < arity {
            return Err(StorageError::InvalidCriteria(format!(
                "{} needs {arity} key argument(s), got {}",
                self.field.name(),
                self.args.len()
            )));
        }
        if self.keys().iter().any(|k| k.as_str().is_none()) {
            return Err(StorageError::InvalidCriteria(format!(
                "{} keys must be strings",
                self.field.name()
            )));
        }
        let count = self.values().len();
        if let Some(expected) = self.op.value_count() {
            if count != expected {
                return Err(StorageError::InvalidCriteria(format!(
                    "{} {} takes {expected} value(s), got {count}",
                    self.field.name(),
                    self.op.symbol()
                )));
            }
        }
        if matches!(self.op, Operator::Like | Operator::ILike) && self.pattern.is_none() {
            return Err(StorageError::InvalidCriteria(format!(
                "{} {} needs a string pattern",
                self.field.name(),
                self.op.symbol()
            )));
        }
        Ok(())
    }

    fn evaluate(&self, actual: &FieldValue) -> bool {
        let present = actual.values();
        let expected = self.values();
        match self.op {
            Operator::Exists => actual.is_present(),
            Operator::NotExists => !actual.is_present(),
            Operator::Eq => present.iter().any(|v| Some(v) == expected.first()),
            Operator::Ne => {
                actual.is_present() && !present.iter().any(|v| Some(v) == expected.first())
            }
            Operator::In => present.iter().any(|v| expected.contains(v)),
            Operator::Lt => ordered(present, expected, |o| o.is_lt()),
            Operator::Le => ordered(present, expected, |o| o.is_le()),
            Operator::Gt => ordered(present, expected, |o| o.is_gt()),
            Operator::Ge => ordered(present, expected, |o| o.is_ge()),
            Operator::Like | Operator::ILike => self.pattern.as_ref().is_some_and(|p| {
                present
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|candidate| p.matches(candidate))
            }),
        }
    }
}

// Only values of the same kind are ordered against each other.
fn ordered(present: &[Value], expected: &[Value], accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let Some(bound) = expected.first() else {
        return false;
    };
    present.iter().any(|v| {
        std::mem::discriminant(v) == std::mem::discriminant(bound) && accept(v.cmp(bound))
    })
}

/// A node of the criteria tree.
#[derive(Debug, Clone)]
pub enum Criterion<F> {
    /// Leaf comparison.
    Compare(Comparison<F>),
    /// Conjunction; empty is true.
    And(Vec<Criterion<F>>),
    /// Disjunction; empty is false.
    Or(Vec<Criterion<F>>),
    /// Negation.
    Not(Box<Criterion<F>>),
}

impl<F: SearchableField> Criterion<F> {
    fn validate(&self) -> StorageResult<()> {
        match self {
            Self::Compare(c) => c.validate(),
            Self::And(items) | Self::Or(items) => items.iter().try_for_each(Self::validate),
            Self::Not(inner) => inner.validate(),
        }
    }

    fn evaluate<E: SearchableEntity<Field = F>>(&self, entity: &E) -> bool {
        match self {
            Self::Compare(c) => c.evaluate(&entity.field_value(c.field, c.keys())),
            Self::And(items) => items.iter().all(|i| i.evaluate(entity)),
            Self::Or(items) => items.iter().any(|i| i.evaluate(entity)),
            Self::Not(inner) => !inner.evaluate(entity),
        }
    }
}

/// A criteria tree under construction or ready for evaluation.
///
/// Comparisons chained on a builder are combined with AND; an empty builder
/// matches every entity.
#[derive(Debug, Clone)]
pub struct Criteria<F> {
    root: Criterion<F>,
}

impl<F: SearchableField> Default for Criteria<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: SearchableField> Criteria<F> {
    /// An empty builder, matching everything.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: Criterion::And(Vec::new()),
        }
    }

    /// Adds a comparison with raw arguments (keys first, then values).
    #[must_use]
    pub fn compare_args(self, field: F, op: Operator, args: Vec<Value>) -> Self {
        self.push(Criterion::Compare(Comparison::new(field, op, args)))
    }

    /// Adds a single-value comparison.
    #[must_use]
    pub fn compare(self, field: F, op: Operator, value: impl Into<Value>) -> Self {
        self.compare_args(field, op, vec![value.into()])
    }

    /// Adds a single-value comparison on a keyed field such as an attribute.
    #[must_use]
    pub fn compare_keyed(self, field: F, key: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.compare_args(field, op, vec![Value::from(key), value.into()])
    }

    /// Adds an `IN` comparison.
    #[must_use]
    pub fn compare_in<V: Into<Value>>(self, field: F, values: impl IntoIterator<Item = V>) -> Self {
        self.compare_args(field, Operator::In, values.into_iter().map(Into::into).collect())
    }

    /// Adds an `EXISTS` check.
    #[must_use]
    pub fn exists(self, field: F) -> Self {
        self.compare_args(field, Operator::Exists, Vec::new())
    }

    /// Adds a `NOT EXISTS` check.
    #[must_use]
    pub fn not_exists(self, field: F) -> Self {
        self.compare_args(field, Operator::NotExists, Vec::new())
    }

    /// AND of several criteria.
    #[must_use]
    pub fn and(items: impl IntoIterator<Item = Self>) -> Self {
        Self {
            root: Criterion::And(items.into_iter().map(|c| c.root).collect()),
        }
    }

    /// OR of several criteria.
    #[must_use]
    pub fn or(items: impl IntoIterator<Item = Self>) -> Self {
        Self {
            root: Criterion::Or(items.into_iter().map(|c| c.root).collect()),
        }
    }

    /// The negation of these criteria.
    #[must_use]
    pub fn negate(self) -> Self {
        Self {
            root: Criterion::Not(Box::new(self.root)),
        }
    }

    /// AND-combines another criteria tree into this one.
    #[must_use]
    pub fn with(self, other: Self) -> Self {
        self.push(other.root)
    }

    fn push(self, node: Criterion<F>) -> Self {
        let root = match self.root {
            Criterion::And(mut items) => {
                items.push(node);
                Criterion::And(items)
            }
            other => Criterion::And(vec![other, node]),
        };
        Self { root }
    }

    /// The tree root.
    #[must_use]
    pub const fn root(&self) -> &Criterion<F> {
        &self.root
    }

    /// True when the criteria match everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(&self.root, Criterion::And(items) if items.is_empty())
    }

    /// Checks argument counts, key types and patterns.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::InvalidCriteria`] for malformed comparisons.
    pub fn validate(&self) -> StorageResult<()> {
        self.root.validate()
    }

    /// Evaluates the criteria against one entity.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::InvalidCriteria`] for malformed comparisons.
    pub fn matches<E: SearchableEntity<Field = F>>(&self, entity: &E) -> StorageResult<bool> {
        self.validate()?;
        Ok(self.root.evaluate(entity))
    }

    /// Evaluates criteria already checked with [`Criteria::validate`].
    #[must_use]
    pub fn matches_unchecked<E: SearchableEntity<Field = F>>(&self, entity: &E) -> bool {
        self.root.evaluate(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kc_model::{Entity, UserEntity, UserField};

    fn alice() -> UserEntity {
        let mut user = UserEntity::new("realm-1", "alice", 1_000);
        user.set_id("u1").unwrap();
        user.set_email(Some("alice@example.com"));
        user.set_first_name(Some("Alice".to_string()));
        user.set_single_attribute("dept", "eng");
        user.add_attribute_value("tags", "red");
        user.add_attribute_value("tags", "blue");
        user
    }

    #[test]
    fn empty_criteria_match_everything() {
        let criteria = Criteria::<UserField>::new();
        assert!(criteria.is_empty());
        assert!(criteria.matches(&alice()).unwrap());
    }

    #[test]
    fn chained_comparisons_are_conjunctive() {
        let criteria = Criteria::new()
            .compare(UserField::RealmId, Operator::Eq, "realm-1")
            .compare_keyed(UserField::Attribute, "dept", Operator::Eq, "eng");
        assert!(criteria.matches(&alice()).unwrap());

        let criteria = criteria.compare(UserField::Username, Operator::Eq, "bob");
        assert!(!criteria.matches(&alice()).unwrap());
    }

    #[test]
    fn multi_valued_fields_match_any_element() {
        let criteria =
            Criteria::new().compare_keyed(UserField::Attribute, "tags", Operator::Eq, "blue");
        assert!(criteria.matches(&alice()).unwrap());

        let criteria = Criteria::new().compare_args(
            UserField::Attribute,
            Operator::In,
            vec!["tags".into(), "green".into(), "red".into()],
        );
        assert!(criteria.matches(&alice()).unwrap());
    }

    #[test]
    fn ilike_is_case_insensitive_with_wildcards() {
        let criteria = Criteria::new().compare(UserField::FirstName, Operator::ILike, "ali%");
        assert!(criteria.matches(&alice()).unwrap());

        let criteria = Criteria::new().compare(UserField::FirstName, Operator::Like, "ali%");
        assert!(!criteria.matches(&alice()).unwrap());

        let criteria = Criteria::new().compare(UserField::Email, Operator::ILike, "%@EXAMPLE.com");
        assert!(criteria.matches(&alice()).unwrap());
    }

    #[test]
    fn quoted_ilike_is_exact_and_case_sensitive() {
        let pattern = LikePattern::parse("\"Alice@Example.com\"", Operator::ILike);
        assert!(pattern.matches("Alice@Example.com"));
        assert!(!pattern.matches("alice@example.com"));
    }

    #[test]
    fn like_escapes_regex_metacharacters() {
        let pattern = LikePattern::parse("a.b%", Operator::Like);
        assert!(pattern.matches("a.bc"));
        assert!(!pattern.matches("axbc"));
    }

    #[test]
    fn exists_and_not_exists() {
        let user = alice();
        let exists = Criteria::new().exists(UserField::Email);
        let missing = Criteria::new().exists(UserField::LastName);
        assert!(exists.matches(&user).unwrap());
        assert!(!missing.matches(&user).unwrap());
        assert!(Criteria::new().not_exists(UserField::LastName).matches(&user).unwrap());
    }

    #[test]
    fn ordering_comparisons() {
        let user = alice();
        let before = Criteria::new().compare(UserField::CreatedTimestamp, Operator::Lt, 2_000_i64);
        let after = Criteria::new().compare(UserField::CreatedTimestamp, Operator::Gt, 2_000_i64);
        assert!(before.matches(&user).unwrap());
        assert!(!after.matches(&user).unwrap());
    }

    #[test]
    fn or_and_negation() {
        let user = alice();
        let either = Criteria::or([
            Criteria::new().compare(UserField::Username, Operator::Eq, "bob"),
            Criteria::new().compare(UserField::Username, Operator::Eq, "alice"),
        ]);
        assert!(either.matches(&user).unwrap());
        assert!(!either.clone().negate().matches(&user).unwrap());
        assert!(!Criteria::<UserField>::or([]).matches(&user).unwrap());
    }

    #[test]
    fn wrong_argument_counts_are_rejected() {
        let missing_key = Criteria::new().compare(UserField::Attribute, Operator::Eq, "eng");
        assert!(matches!(
            missing_key.matches(&alice()),
            Err(StorageError::InvalidCriteria(_))
        ));

        let extra = Criteria::<UserField>::new().compare_args(
            UserField::Username,
            Operator::Eq,
            vec!["a".into(), "b".into()],
        );
        assert!(extra.validate().is_err());
    }
}
