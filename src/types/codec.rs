//! Type codec: host values <-> bridge values.
//!
//! | `Value`       | bridge value               | bridge type           |
//! |---------------|----------------------------|-----------------------|
//! | `Null`        | `Null`                     | declared or VARCHAR   |
//! | `Bool`        | `Int(0 / 1)`               | BIT                   |
//! | `Int`         | `Int`                      | BIGINT                |
//! | `Float`       | `Float`                    | DOUBLE                |
//! | `Decimal`     | `Text("42.00")`            | DECIMAL(p, s)         |
//! | `Date`        | `Text("2013-10-12")`       | DATE                  |
//! | `Time`        | `Text("00:37:14.5")`       | TIME                  |
//! | `Timestamp`   | `Text("2013-10-12 00:37:14")` | TIMESTAMP          |
//! | `TimestampTz` | same, normalized to UTC    | TIMESTAMP             |
//! | `Text`        | `Text(utf8)`               | VARCHAR(n) / CHAR(n)  |
//! | `Binary`      | `Binary`                   | BINARY(n)             |
//! | `Bits`        | `Bit` or `Text("1010")`    | BIT / VARCHAR(n)      |
//! | `Array`/`Object` | `Text(json)`            | VARCHAR(n)            |
//!
//! Decimals never pass through floating point. Array and object elements
//! must be JSON-native (null, bool, int, finite float, text, nested
//! array/object); anything else would come back as text and is refused.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use super::TypeKind;
use crate::bridge::{BridgeParam, BridgeValue, SqlType};
use crate::error::{Error, Result};
use crate::value::{Value, bits_to_string};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Largest precision a NUMBER column can declare.
const MAX_PRECISION: u32 = 38;

// ==================== Encode ====================

/// Encode a host value as a bridge parameter.
///
/// `declared` refines the bridge type tag and, for decimal targets, the
/// scale. A value that cannot be represented exactly in the declared type
/// is an error.
pub fn encode(value: &Value, declared: Option<&TypeKind>) -> Result<BridgeParam> {
    let param = match value {
        Value::Null => BridgeParam {
            sql_type: declared.map(sql_type_for).unwrap_or(SqlType::Varchar(1)),
            value: BridgeValue::Null,
        },
        Value::Bool(b) => BridgeParam {
            sql_type: SqlType::Bit,
            value: BridgeValue::Int(i64::from(*b)),
        },
        Value::Int(i) => match declared {
            Some(TypeKind::Decimal { precision, scale }) => {
                encode_decimal(Decimal::from(*i), Some((*precision, *scale)))?
            }
            Some(kind) if kind.is_textual() => text_param(i.to_string(), Some(kind)),
            _ => BridgeParam {
                sql_type: SqlType::Bigint,
                value: BridgeValue::Int(*i),
            },
        },
        Value::Float(f) => BridgeParam {
            sql_type: SqlType::Double,
            value: BridgeValue::Float(*f),
        },
        Value::Decimal(d) => match declared {
            Some(TypeKind::Decimal { precision, scale }) => {
                encode_decimal(*d, Some((*precision, *scale)))?
            }
            Some(TypeKind::Integer) => encode_decimal(*d, Some((MAX_PRECISION, 0)))?,
            _ => encode_decimal(*d, None)?,
        },
        Value::Date(d) => BridgeParam {
            sql_type: SqlType::Date,
            value: BridgeValue::text(d.format(DATE_FORMAT).to_string()),
        },
        Value::Time(t) => BridgeParam {
            sql_type: SqlType::Time,
            value: BridgeValue::text(t.format(TIME_FORMAT).to_string()),
        },
        Value::Timestamp(ts) => BridgeParam {
            sql_type: SqlType::Timestamp,
            value: BridgeValue::text(ts.format(TIMESTAMP_FORMAT).to_string()),
        },
        Value::TimestampTz(ts) => BridgeParam {
            sql_type: SqlType::Timestamp,
            value: BridgeValue::text(ts.naive_utc().format(TIMESTAMP_FORMAT).to_string()),
        },
        Value::Text(s) => text_param(s.clone(), declared),
        Value::Binary(bytes) => BridgeParam {
            sql_type: SqlType::Binary(len_u32(bytes.len())),
            value: BridgeValue::Binary(bytes.clone()),
        },
        Value::Bits(bits) if bits.len() == 1 => BridgeParam {
            sql_type: SqlType::Bit,
            value: BridgeValue::Bit(bits[0]),
        },
        Value::Bits(bits) => text_param(bits_to_string(bits), None),
        Value::Array(_) | Value::Object(_) => {
            check_json_native(value)?;
            text_param(value.to_json().to_string(), None)
        }
    };
    Ok(param)
}

/// Refuse elements that JSON would turn into strings or nulls.
fn check_json_native(value: &Value) -> Result<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Text(_) => Ok(()),
        Value::Float(f) if f.is_finite() => Ok(()),
        Value::Array(items) => items.iter().try_for_each(check_json_native),
        Value::Object(map) => map.values().try_for_each(check_json_native),
        other => Err(Error::decode(format!(
            "{} element cannot be stored in a semi-structured value without loss",
            other.type_name()
        ))),
    }
}

fn text_param(text: String, declared: Option<&TypeKind>) -> BridgeParam {
    let len = len_u32(text.chars().count()).max(1);
    let sql_type = match declared {
        Some(TypeKind::Char { length }) => SqlType::Char((*length).max(len)),
        _ => SqlType::Varchar(len),
    };
    BridgeParam {
        sql_type,
        value: BridgeValue::text(text),
    }
}

fn encode_decimal(d: Decimal, target: Option<(u32, u32)>) -> Result<BridgeParam> {
    let (precision, scale, d) = match target {
        Some((precision, scale)) => {
            let d = rescale_exact(d, scale)?;
            if digit_count(&d) > precision {
                return Err(Error::decode(format!(
                    "{} does not fit NUMBER({}, {})",
                    d, precision, scale
                )));
            }
            (precision, scale, d)
        }
        None => {
            let scale = d.scale();
            (digit_count(&d).max(scale + 1).min(MAX_PRECISION), scale, d)
        }
    };
    Ok(BridgeParam {
        sql_type: SqlType::Decimal { precision, scale },
        value: BridgeValue::text(d.to_string()),
    })
}

/// Significant digits of the mantissa, i.e. the precision `d` needs at its
/// current scale.
fn digit_count(d: &Decimal) -> u32 {
    len_u32(d.mantissa().unsigned_abs().to_string().len())
}

/// Rescale `d` to `scale` digits, refusing to drop non-zero digits.
fn rescale_exact(d: Decimal, scale: u32) -> Result<Decimal> {
    let mut scaled = d;
    scaled.rescale(scale);
    if scaled != d {
        return Err(Error::decode(format!(
            "{} does not fit scale {} without rounding",
            d, scale
        )));
    }
    Ok(scaled)
}

fn sql_type_for(kind: &TypeKind) -> SqlType {
    match kind {
        TypeKind::Integer => SqlType::Bigint,
        TypeKind::Decimal { precision, scale } => SqlType::Decimal {
            precision: *precision,
            scale: *scale,
        },
        TypeKind::Float => SqlType::Double,
        TypeKind::Boolean | TypeKind::Bit => SqlType::Bit,
        TypeKind::Date => SqlType::Date,
        TypeKind::Time => SqlType::Time,
        TypeKind::Timestamp | TypeKind::TimestampTz => SqlType::Timestamp,
        TypeKind::Char { length } => SqlType::Char(*length),
        TypeKind::Varchar { length } => SqlType::Varchar(length.unwrap_or(1)),
        TypeKind::Binary { length } => SqlType::Binary(length.unwrap_or(1)),
        TypeKind::Array | TypeKind::Object | TypeKind::Variant => SqlType::Varchar(1),
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

// ==================== Decode ====================

/// Decode a bridge cell into a host value for a column of type `kind`.
pub fn decode(value: &BridgeValue, kind: &TypeKind) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        TypeKind::Integer => decode_integer(value),
        TypeKind::Decimal { scale, .. } => decode_decimal(value, *scale),
        TypeKind::Float => decode_float(value),
        TypeKind::Boolean => decode_bool(value),
        TypeKind::Date => {
            let s = text(value)?;
            NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map(Value::Date)
                .map_err(|e| Error::decode(format!("invalid date {:?}: {}", s, e)))
        }
        TypeKind::Time => {
            let s = text(value)?;
            NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
                .map(Value::Time)
                .map_err(|e| Error::decode(format!("invalid time {:?}: {}", s, e)))
        }
        TypeKind::Timestamp => {
            let s = text(value)?;
            parse_naive_timestamp(s.trim())
                .map(Value::Timestamp)
                .ok_or_else(|| Error::decode(format!("invalid timestamp {:?}", s)))
        }
        TypeKind::TimestampTz => {
            let s = text(value)?;
            parse_zoned_timestamp(s.trim())
                .map(Value::TimestampTz)
                .ok_or_else(|| Error::decode(format!("invalid timestamp {:?}", s)))
        }
        TypeKind::Char { .. } | TypeKind::Varchar { .. } => decode_text(value),
        TypeKind::Binary { .. } => decode_binary(value),
        TypeKind::Bit => decode_bits(value),
        TypeKind::Array | TypeKind::Object | TypeKind::Variant => decode_json(value, kind),
    }
}

fn text(value: &BridgeValue) -> Result<String> {
    match value {
        BridgeValue::Text(bytes) | BridgeValue::Binary(bytes) => utf8(bytes),
        BridgeValue::Int(i) => Ok(i.to_string()),
        BridgeValue::Float(f) => Ok(f.to_string()),
        BridgeValue::Bit(b) => Ok(b.to_string()),
        BridgeValue::Null => Ok(String::new()),
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::decode(format!("invalid UTF-8 in text column: {}", e)))
}

fn decode_integer(value: &BridgeValue) -> Result<Value> {
    match value {
        BridgeValue::Int(i) => Ok(Value::Int(*i)),
        BridgeValue::Bit(b) => Ok(Value::Int(i64::from(*b))),
        BridgeValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
            Ok(Value::Int(*f as i64))
        }
        _ => {
            let s = text(value)?;
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::Int(i));
            }
            // Beyond i64: keep every digit as a zero-scale decimal.
            match Decimal::from_str(s) {
                Ok(d) if d.fract().is_zero() => {
                    let mut d = d;
                    d.rescale(0);
                    Ok(Value::Decimal(d))
                }
                _ => Err(Error::decode(format!("invalid integer {:?}", s))),
            }
        }
    }
}

fn decode_decimal(value: &BridgeValue, scale: u32) -> Result<Value> {
    let d = match value {
        BridgeValue::Int(i) => Decimal::from(*i),
        _ => {
            let s = text(value)?;
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|e| Error::decode(format!("invalid decimal {:?}: {}", s, e)))?
        }
    };
    if d.scale() < scale {
        let mut d = d;
        d.rescale(scale);
        return Ok(Value::Decimal(d));
    }
    Ok(Value::Decimal(d))
}

fn decode_float(value: &BridgeValue) -> Result<Value> {
    match value {
        BridgeValue::Float(f) => Ok(Value::Float(*f)),
        BridgeValue::Int(i) => Ok(Value::Float(*i as f64)),
        _ => {
            let s = text(value)?;
            s.trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| Error::decode(format!("invalid float {:?}: {}", s, e)))
        }
    }
}

fn decode_bool(value: &BridgeValue) -> Result<Value> {
    match value {
        BridgeValue::Bit(b) => Ok(Value::Bool(*b)),
        BridgeValue::Int(i) => Ok(Value::Bool(*i != 0)),
        _ => {
            let s = text(value)?;
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" | "on" => Ok(Value::Bool(true)),
                "false" | "f" | "0" | "no" | "n" | "off" => Ok(Value::Bool(false)),
                _ => Err(Error::decode(format!("invalid boolean {:?}", s))),
            }
        }
    }
}

fn decode_text(value: &BridgeValue) -> Result<Value> {
    text(value).map(Value::Text)
}

fn decode_binary(value: &BridgeValue) -> Result<Value> {
    match value {
        BridgeValue::Binary(bytes) => Ok(Value::Binary(bytes.clone())),
        BridgeValue::Text(bytes) => {
            // BINARY_OUTPUT_FORMAT defaults to HEX
            let s = utf8(bytes)?;
            hex_decode(s.trim())
                .map(Value::Binary)
                .ok_or_else(|| Error::decode(format!("invalid hex binary {:?}", s)))
        }
        other => Err(Error::decode(format!(
            "cannot decode {:?} as binary",
            other
        ))),
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn decode_bits(value: &BridgeValue) -> Result<Value> {
    match value {
        BridgeValue::Bit(b) => Ok(Value::Bits(vec![*b])),
        BridgeValue::Int(i) => Ok(Value::Bits(vec![*i != 0])),
        _ => {
            let s = text(value)?;
            s.trim()
                .chars()
                .map(|c| match c {
                    '1' => Ok(true),
                    '0' => Ok(false),
                    _ => Err(Error::decode(format!("invalid bit string {:?}", s))),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Bits)
        }
    }
}

fn decode_json(value: &BridgeValue, kind: &TypeKind) -> Result<Value> {
    let s = text(value)?;
    let json: serde_json::Value = serde_json::from_str(&s)
        .map_err(|e| Error::decode(format!("invalid {} value: {}", kind, e)))?;
    match (kind, &json) {
        (TypeKind::Array, serde_json::Value::Array(_))
        | (TypeKind::Object, serde_json::Value::Object(_))
        | (TypeKind::Variant, _) => Ok(Value::from_json(&json)),
        _ => Err(Error::decode(format!("expected {}, got {}", kind, json))),
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Zoned timestamps arrive with an offset suffix; a bare timestamp is UTC.
fn parse_zoned_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    const ZONED: [&str; 3] = [
        "%Y-%m-%d %H:%M:%S%.f %:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f %z",
    ];
    ZONED
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok())
        .or_else(|| parse_naive_timestamp(s).map(|ts| ts.and_utc().fixed_offset()))
}
