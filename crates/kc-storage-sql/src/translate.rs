//! Criteria to SQL over the JSONB document.
//!
//! Every field is turned into a row source of JSONB values named `j`: one
//! row for a scalar, one row per element for collections. A comparison then
//! holds when some present value satisfies it, which is the same
//! any-element rule the in-memory evaluation applies.
//!
//! Strings are ordered with `COLLATE "C"` so that ordering matches byte
//! order, and values of a different JSON type never satisfy an ordering
//! comparison.

use kc_model::{FieldPath, SearchableField, Value};
use kc_storage::{Comparison, Criterion, LikePattern, Operator, Order, QueryParameters};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

const PRESENT: &str = "s.j IS NOT NULL AND s.j <> 'null'::jsonb";

/// Converts a criteria value to its JSON form.
#[must_use]
pub fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Str(s) => serde_json::Value::String(s.clone()),
    }
}

/// Escapes `_` and `\`, which are wildcards in SQL `LIKE` but literals in
/// criteria patterns.
#[must_use]
pub fn escape_like(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '\\' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn key_of(keys: &[Value]) -> Option<String> {
    keys.first().and_then(Value::as_str).map(str::to_string)
}

/// Pushes a subquery yielding the values of `path` as column `j`.
fn push_source(qb: &mut QueryBuilder<'static, Postgres>, path: FieldPath, keys: &[Value]) {
    match path {
        FieldPath::Scalar(name) => {
            qb.push(format_args!("SELECT data->'{name}' AS j"));
        }
        FieldPath::Map(name) => {
            qb.push(format_args!("SELECT data->'{name}'->"));
            qb.push_bind(key_of(keys).unwrap_or_default());
            qb.push(" AS j");
        }
        FieldPath::Array(name) => {
            qb.push(format_args!(
                "SELECT e.j FROM jsonb_array_elements(COALESCE(data->'{name}', '[]'::jsonb)) AS e(j)"
            ));
        }
        FieldPath::MultiMap(name) => {
            qb.push(format_args!("SELECT e.j FROM jsonb_array_elements(COALESCE(data->'{name}'->"));
            qb.push_bind(key_of(keys).unwrap_or_default());
            qb.push(", '[]'::jsonb)) AS e(j)");
        }
        FieldPath::MapKeys(name) => {
            qb.push(format_args!(
                "SELECT to_jsonb(k.key) AS j FROM jsonb_object_keys(COALESCE(data->'{name}', '{{}}'::jsonb)) AS k(key)"
            ));
        }
        FieldPath::Nested(array, property) => {
            qb.push(format_args!(
                "SELECT e.o->'{property}' AS j FROM jsonb_array_elements(COALESCE(data->'{array}', '[]'::jsonb)) AS e(o)"
            ));
        }
    }
}

/// Pushes `EXISTS (SELECT 1 FROM (<source>) AS s WHERE <present> AND ...)`
/// and leaves the builder positioned for the extra condition.
fn open_any<F: SearchableField>(qb: &mut QueryBuilder<'static, Postgres>, comparison: &Comparison<F>) {
    qb.push("EXISTS (SELECT 1 FROM (");
    push_source(qb, comparison.field().path(), comparison.keys());
    qb.push(format_args!(") AS s WHERE {PRESENT}"));
}

fn push_ordering_condition(qb: &mut QueryBuilder<'static, Postgres>, op: Operator, bound: &Value) {
    let symbol = op.symbol();
    match bound {
        Value::Str(s) => {
            qb.push(format_args!(
                " AND jsonb_typeof(s.j) = 'string' AND (s.j #>> '{{}}') COLLATE \"C\" {symbol} "
            ));
            qb.push_bind(s.clone());
        }
        other => {
            qb.push(" AND jsonb_typeof(s.j) = jsonb_typeof(");
            qb.push_bind(Json(json_value(other)));
            qb.push(format_args!(") AND s.j {symbol} "));
            qb.push_bind(Json(json_value(other)));
        }
    }
}

fn push_pattern_condition(qb: &mut QueryBuilder<'static, Postgres>, pattern: &LikePattern) {
    qb.push(" AND jsonb_typeof(s.j) = 'string' AND ");
    match pattern {
        LikePattern::Exact {
            value,
            case_sensitive: true,
        } => {
            qb.push("(s.j #>> '{}') = ");
            qb.push_bind(value.clone());
        }
        LikePattern::Exact {
            value,
            case_sensitive: false,
        } => {
            qb.push("lower(s.j #>> '{}') = lower(");
            qb.push_bind(value.clone());
            qb.push(")");
        }
        LikePattern::Wildcard {
            pattern,
            case_sensitive,
            ..
        } => {
            qb.push(if *case_sensitive { "(s.j #>> '{}') LIKE " } else { "(s.j #>> '{}') ILIKE " });
            qb.push_bind(escape_like(pattern));
        }
    }
}

fn push_comparison<F: SearchableField>(qb: &mut QueryBuilder<'static, Postgres>, comparison: &Comparison<F>) {
    let values = comparison.values();
    match comparison.op() {
        Operator::Exists => {
            open_any(qb, comparison);
            qb.push(")");
        }
        Operator::NotExists => {
            qb.push("NOT ");
            open_any(qb, comparison);
            qb.push(")");
        }
        Operator::Eq => {
            open_any(qb, comparison);
            qb.push(" AND s.j = ");
            qb.push_bind(Json(values.first().map(json_value).unwrap_or_default()));
            qb.push(")");
        }
        Operator::Ne => {
            qb.push("(");
            open_any(qb, comparison);
            qb.push(") AND NOT ");
            open_any(qb, comparison);
            qb.push(" AND s.j = ");
            qb.push_bind(Json(values.first().map(json_value).unwrap_or_default()));
            qb.push("))");
        }
        Operator::In => {
            if values.is_empty() {
                qb.push("FALSE");
                return;
            }
            open_any(qb, comparison);
            qb.push(" AND s.j IN (");
            let mut list = qb.separated(", ");
            for value in values {
                list.push_bind(Json(json_value(value)));
            }
            qb.push("))");
        }
        op @ (Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => {
            let Some(bound) = values.first() else {
                qb.push("FALSE");
                return;
            };
            open_any(qb, comparison);
            push_ordering_condition(qb, op, bound);
            qb.push(")");
        }
        Operator::Like | Operator::ILike => {
            let Some(pattern) = comparison.pattern() else {
                qb.push("FALSE");
                return;
            };
            open_any(qb, comparison);
            push_pattern_condition(qb, pattern);
            qb.push(")");
        }
    }
}

/// Pushes the boolean SQL form of a criteria tree.
pub fn push_criterion<F: SearchableField>(qb: &mut QueryBuilder<'static, Postgres>, criterion: &Criterion<F>) {
    match criterion {
        Criterion::Compare(comparison) => push_comparison(qb, comparison),
        Criterion::And(items) | Criterion::Or(items) if items.is_empty() => {
            qb.push(if matches!(criterion, Criterion::And(_)) { "TRUE" } else { "FALSE" });
        }
        Criterion::And(items) | Criterion::Or(items) => {
            let joiner = if matches!(criterion, Criterion::And(_)) { " AND " } else { " OR " };
            qb.push("(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_criterion(qb, item);
            }
            qb.push(")");
        }
        Criterion::Not(inner) => {
            qb.push("NOT (");
            push_criterion(qb, inner);
            qb.push(")");
        }
    }
}

// Sort key of a field: the scalar itself, or the smallest element.
fn sort_key(path: FieldPath) -> String {
    match path {
        FieldPath::Scalar(name) => format!("NULLIF(data->'{name}', 'null'::jsonb)"),
        // Keyed fields have no key to order by.
        FieldPath::Map(_) | FieldPath::MultiMap(_) => "NULL::jsonb".to_string(),
        other => {
            let mut source = QueryBuilder::<Postgres>::new("");
            push_source(&mut source, other, &[]);
            format!(
                "(SELECT s.j FROM ({}) AS s WHERE {PRESENT} ORDER BY (s.j #>> '{{}}') COLLATE \"C\" LIMIT 1)",
                source.sql()
            )
        }
    }
}

/// Pushes `WHERE entity_type = $1 AND (<criteria>)`.
pub fn push_filter<F: SearchableField>(
    qb: &mut QueryBuilder<'static, Postgres>,
    entity_type: &'static str,
    query: &QueryParameters<F>,
) {
    qb.push(" WHERE entity_type = ");
    qb.push_bind(entity_type);
    if !query.criteria().is_empty() {
        qb.push(" AND ");
        push_criterion(qb, query.criteria().root());
    }
}

/// Pushes `ORDER BY` and pagination.
///
/// Numbers sort before strings and absent values last, ascending; a
/// descending order reverses all of it. `id` breaks ties.
pub fn push_order_and_page<F: SearchableField>(qb: &mut QueryBuilder<'static, Postgres>, query: &QueryParameters<F>) {
    qb.push(" ORDER BY ");
    for order_by in query.ordering() {
        let key = sort_key(order_by.field.path());
        let direction = match order_by.order {
            Order::Ascending => "ASC NULLS LAST",
            Order::Descending => "DESC NULLS FIRST",
        };
        qb.push(format_args!(
            "CASE WHEN jsonb_typeof({key}) = 'number' THEN ({key} #>> '{{}}')::numeric END {direction}, \
             ({key} #>> '{{}}') COLLATE \"C\" {direction}, "
        ));
    }
    qb.push("id");

    if let Some(limit) = query.limit() {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if let Some(offset) = query.offset() {
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
    }
}
