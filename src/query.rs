//! Queries, parameters and results.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::types::TypeKind;
use crate::value::Value;

/// A statement plus an advisory name.
///
/// The name is never sent to the warehouse and nothing is prepared
/// server-side. Protocol remembers the most recently prepared statement
/// text under each name, so two queries sharing a name but differing in
/// text overwrite each other for any call that executes *by name*.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub name: Option<String>,
    pub statement: String,
}

impl Query {
    /// An unnamed query.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            name: None,
            statement: statement.into(),
        }
    }

    /// A query with an advisory name.
    pub fn named(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            statement: statement.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.statement)
    }
}

impl From<&str> for Query {
    fn from(statement: &str) -> Self {
        Query::new(statement)
    }
}

impl From<String> for Query {
    fn from(statement: String) -> Self {
        Query::new(statement)
    }
}

/// A bound parameter with an optional declared type.
///
/// Without a declaration the type is inferred from the value.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub declared: Option<TypeKind>,
}

impl Param {
    /// Declare the parameter's warehouse type explicitly.
    pub fn typed(value: impl Into<Value>, kind: TypeKind) -> Self {
        Self {
            value: value.into(),
            declared: Some(kind),
        }
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Self {
            value,
            declared: None,
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        Value::from(value).into()
    }
}

macro_rules! param_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from(value: $ty) -> Self {
                    Value::from(value).into()
                }
            }
        )*
    };
}

param_from!(
    bool,
    i32,
    i64,
    f64,
    Decimal,
    &str,
    String,
    Vec<u8>,
    NaiveDate,
    NaiveTime,
    NaiveDateTime,
    DateTime<FixedOffset>,
    DateTime<Utc>,
);

/// Outcome of a successful execute or fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names in result order. Empty for row-affecting statements.
    pub columns: Vec<String>,
    /// Rows fetched, or rows affected.
    pub num_rows: u64,
    pub rows: Vec<Vec<Value>>,
    /// Non-zero when diagnostics can be read with `SHOW WARNINGS`.
    pub num_warnings: u32,
    /// Warehouse query id, when the bridge reported one.
    pub query_id: Option<String>,
}

impl QueryResult {
    pub(crate) fn affected(rows: u64, warnings: u32) -> Self {
        Self {
            num_rows: rows,
            num_warnings: warnings,
            ..Default::default()
        }
    }

    /// Index of a column by name (case-insensitive, as the warehouse
    /// folds unquoted identifiers).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Rows as `{column: value}` JSON objects.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.rows
                .iter()
                .map(|row| {
                    serde_json::Value::Object(
                        self.columns
                            .iter()
                            .zip(row)
                            .map(|(c, v)| (c.clone(), v.to_json()))
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}
