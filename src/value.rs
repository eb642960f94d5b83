//! Host-side values.
//!
//! | Snowflake       | `Value`                         |
//! |-----------------|---------------------------------|
//! | NULL            | `Null`                          |
//! | BOOLEAN         | `Bool(true)`                    |
//! | NUMBER(p, 0)    | `Int(42)`                       |
//! | NUMBER(p, s)    | `Decimal(42.00)`                |
//! | FLOAT           | `Float(42.0)`                   |
//! | DATE            | `Date(2013-10-12)`              |
//! | TIME            | `Time(00:37:14)`                |
//! | TIMESTAMP_NTZ   | `Timestamp(2013-10-12 00:37:14)`|
//! | TIMESTAMP_TZ    | `TimestampTz(..+00:00)`         |
//! | CHAR / VARCHAR  | `Text("é")`                     |
//! | BINARY          | `Binary([1, 2, 3])`             |
//! | BIT             | `Bits([true, false])`           |
//! | ARRAY           | `Array([..])`                   |
//! | OBJECT          | `Object({..})`                  |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

/// A decoded cell value, or a parameter to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamp without zone.
    Timestamp(NaiveDateTime),
    /// Zoned timestamp. Equality compares instants, not offsets.
    TimestampTz(DateTime<FixedOffset>),
    Text(String),
    Binary(Vec<u8>),
    Bits(Vec<bool>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamp with time zone",
            Value::Text(_) => "text",
            Value::Binary(_) => "binary",
            Value::Bits(_) => "bit",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON, the representation used for semi-structured columns.
    ///
    /// Decimals and temporal values become strings so no precision is lost.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Decimal(d) => Json::String(d.to_string()),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Json::String(t.format("%H:%M:%S%.f").to_string()),
            Value::Timestamp(ts) => Json::String(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::TimestampTz(ts) => Json::String(ts.to_rfc3339()),
            Value::Text(s) => Json::String(s.clone()),
            Value::Binary(bytes) => Json::String(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
            Value::Bits(bits) => Json::String(bits_to_string(bits)),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a value from JSON.
    ///
    /// Integers that do not fit `i64` become decimals when they can be
    /// represented exactly, otherwise floats.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(d) = n.as_u64().and_then(Decimal::from_u64) {
                    Value::Decimal(d)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

pub(crate) fn bits_to_string(bits: &[bool]) -> String {
    bits.iter().map(|b| if *b { '1' } else { '0' }).collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::TimestampTz(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Text(s) => write!(f, "{}", s),
            Value::Binary(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Bits(bits) => write!(f, "b'{}'", bits_to_string(bits)),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

// Implement From traits for Value

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::TimestampTz(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::TimestampTz(v.fixed_offset())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from("hello"), Value::Text("hello".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(
            Value::from(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(Value::from(vec![1u8, 2]), Value::Binary(vec![1, 2]));
    }

    #[test]
    fn test_zoned_equality_is_by_instant() {
        let utc = DateTime::parse_from_rfc3339("2013-10-12T00:37:14+00:00").unwrap();
        let cet = DateTime::parse_from_rfc3339("2013-10-12T02:37:14+02:00").unwrap();
        assert_eq!(Value::TimestampTz(utc), Value::TimestampTz(cet));
    }

    #[test]
    fn test_json_keeps_decimal_exact() {
        let d = Decimal::from_str("42.00").unwrap();
        assert_eq!(Value::Decimal(d).to_json(), serde_json::json!("42.00"));
    }

    #[test]
    fn test_from_json_nested() {
        let json = serde_json::json!({"key": "value", "list": [1, null, true]});
        let value = Value::from_json(&json);
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        assert_eq!(map["key"], Value::Text("value".to_string()));
        assert_eq!(
            map["list"],
            Value::Array(vec![Value::Int(1), Value::Null, Value::Bool(true)])
        );
    }
}
