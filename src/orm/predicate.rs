//! Predicate DSL for the storage port.
//!
//! A predicate is a tree of leaf comparisons combined with `and`/`or`.
//! Adapters translate the tree to their dialect; the in-memory adapter
//! evaluates it directly against JSON rows.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
}

/// A predicate tree over row columns.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Matches every row.
    All,
    /// Leaf comparison `column op value`.
    Cmp {
        /// Column name
        column: String,
        /// Comparison operator
        op: CmpOp,
        /// Right-hand value
        value: Value,
    },
    /// Column is absent or JSON null.
    IsNull(String),
    /// Column value is one of the listed values.
    In {
        /// Column name
        column: String,
        /// Accepted values
        values: Vec<Value>,
    },
    /// String column matches a SQL-style `LIKE` pattern (`%` wildcard).
    Like {
        /// Column name
        column: String,
        /// Pattern with `%` matching any run of characters
        pattern: String,
    },
    /// Every child matches.
    And(Vec<Predicate>),
    /// At least one child matches.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// `column = value`
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Eq, value)
    }

    /// `column != value`
    #[must_use]
    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Ne, value)
    }

    /// `column < value`
    #[must_use]
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Lt, value)
    }

    /// `column <= value`
    #[must_use]
    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Lte, value)
    }

    /// `column > value`
    #[must_use]
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Gt, value)
    }

    /// `column >= value`
    #[must_use]
    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, CmpOp::Gte, value)
    }

    /// `column IS NULL`
    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    /// `column IN (values…)`
    #[must_use]
    pub fn is_in(
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column LIKE pattern`, with `%` as the wildcard
    #[must_use]
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    /// Combine with another predicate under `AND`.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut children) => {
                children.push(other);
                Self::And(children)
            }
            p => Self::And(vec![p, other]),
        }
    }

    /// Combine with another predicate under `OR`.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut children) => {
                children.push(other);
                Self::Or(children)
            }
            p => Self::Or(vec![p, other]),
        }
    }

    fn cmp(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Self::Cmp {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate the predicate against a row.
    #[must_use]
    pub fn matches(&self, row: &serde_json::Map<String, Value>) -> bool {
        match self {
            Self::All => true,
            Self::IsNull(column) => matches!(row.get(column), None | Some(Value::Null)),
            Self::Cmp { column, op, value } => {
                let Some(actual) = row.get(column) else {
                    // Absent columns only satisfy explicit inequality.
                    return *op == CmpOp::Ne && !value.is_null();
                };
                compare(actual, value).map_or(false, |ord| match op {
                    CmpOp::Eq => ord == std::cmp::Ordering::Equal,
                    CmpOp::Ne => ord != std::cmp::Ordering::Equal,
                    CmpOp::Lt => ord == std::cmp::Ordering::Less,
                    CmpOp::Lte => ord != std::cmp::Ordering::Greater,
                    CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                    CmpOp::Gte => ord != std::cmp::Ordering::Less,
                })
            }
            Self::In { column, values } => row
                .get(column)
                .is_some_and(|actual| {
                    values.iter().any(|v| {
                        compare(actual, v) == Some(std::cmp::Ordering::Equal)
                    })
                }),
            Self::Like { column, pattern } => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|s| like_matches(pattern, s)),
            Self::And(children) => children.iter().all(|c| c.matches(row)),
            Self::Or(children) => children.iter().any(|c| c.matches(row)),
        }
    }
}

/// SQL-style `LIKE` with `%` as the only wildcard.
fn like_matches(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(after) = rest.strip_prefix(part) else {
                return false;
            };
            rest = after;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(found) = rest.find(part) else {
                return false;
            };
            rest = &rest[found + part.len()..];
        }
    }
    true
}

/// Compare two JSON values for predicate evaluation.
///
/// Numbers compare numerically; strings that both parse as RFC 3339
/// timestamps compare as instants; everything else falls back to string
/// or structural equality.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().map(|y| (x, y)))
                .and_then(|(x, y)| x.partial_cmp(&y))
        }
        (Value::String(x), Value::String(y)) => {
            match (parse_timestamp(x), parse_timestamp(y)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
        _ => {
            if a == b {
                Some(std::cmp::Ordering::Equal)
            } else {
                None
            }
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
