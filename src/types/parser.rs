//! Type parser.
//!
//! Turns warehouse type descriptions into [`ColumnType`]s. Two sources:
//!
//! - catalog rows (`DESCRIBE RESULT` / `DESCRIBE TABLE`), whose `type`
//!   column holds strings such as `NUMBER(38,0)` or `TIMESTAMP_NTZ(9)`
//! - an already fetched result set, classified by the first non-null
//!   value of each column
//!
//! Inference is a heuristic. A column whose sampled rows are all null is
//! typed as text, and a later batch holding values of another shape will
//! still be decoded as text.

use nom::{
    IResult,
    bytes::complete::take_while1,
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map_res, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, tuple},
};

use super::{ColumnType, TypeKind};
use crate::bridge::{BridgeValue, ResultSet};
use crate::error::{Error, Result};

/// One row of warehouse column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub name: String,
    /// Raw type string as reported, e.g. `NUMBER(10,2)`.
    pub data_type: String,
    /// Overrides the precision embedded in `data_type`.
    pub precision: Option<u32>,
    /// Overrides the scale embedded in `data_type`.
    pub scale: Option<u32>,
}

impl CatalogRow {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            precision: None,
            scale: None,
        }
    }

    /// Read catalog rows out of a `DESCRIBE` result.
    ///
    /// Columns are located by name: `name` (or `column_name`), `type` (or
    /// `data_type`), and optionally `numeric_precision` / `numeric_scale`.
    pub fn from_result_set(set: &ResultSet) -> Result<Vec<CatalogRow>> {
        let find = |names: &[&str]| {
            set.columns
                .iter()
                .position(|c| names.iter().any(|n| c.eq_ignore_ascii_case(n)))
        };
        let name_idx = find(&["name", "column_name"])
            .ok_or_else(|| Error::decode("catalog result has no name column"))?;
        let type_idx = find(&["type", "data_type"])
            .ok_or_else(|| Error::decode("catalog result has no type column"))?;
        let precision_idx = find(&["numeric_precision", "precision"]);
        let scale_idx = find(&["numeric_scale", "scale"]);

        set.rows
            .iter()
            .map(|row| -> Result<CatalogRow> {
                let cell = |idx: usize| {
                    row.get(idx)
                        .map(cell_text)
                        .transpose()
                        .map(Option::flatten)
                };
                let number = |idx: Option<usize>| -> Result<Option<u32>> {
                    match idx {
                        Some(idx) => Ok(cell(idx)?.and_then(|s| s.trim().parse().ok())),
                        None => Ok(None),
                    }
                };
                Ok(CatalogRow {
                    name: cell(name_idx)?.unwrap_or_default(),
                    data_type: cell(type_idx)?.unwrap_or_default(),
                    precision: number(precision_idx)?,
                    scale: number(scale_idx)?,
                })
            })
            .collect()
    }

    /// Resolve this row's type.
    pub fn kind(&self) -> TypeKind {
        let kind = parse_type(&self.data_type);
        match (kind, self.precision, self.scale) {
            (TypeKind::Integer | TypeKind::Decimal { .. }, p, Some(s)) => {
                let p = p.unwrap_or(match kind {
                    TypeKind::Decimal { precision, .. } => precision,
                    _ => 38,
                });
                numeric(p, s)
            }
            (TypeKind::Decimal { scale, .. }, Some(p), None) => numeric(p, scale),
            _ => kind,
        }
    }
}

fn cell_text(value: &BridgeValue) -> Result<Option<String>> {
    match value {
        BridgeValue::Null => Ok(None),
        BridgeValue::Text(bytes) => String::from_utf8(bytes.clone())
            .map(Some)
            .map_err(|e| Error::decode(format!("invalid UTF-8 in catalog row: {}", e))),
        BridgeValue::Int(i) => Ok(Some(i.to_string())),
        BridgeValue::Float(f) => Ok(Some(f.to_string())),
        BridgeValue::Bit(b) => Ok(Some(b.to_string())),
        BridgeValue::Binary(_) => Ok(None),
    }
}

/// Where column types come from.
#[derive(Debug, Clone, Copy)]
pub enum ColumnSource<'a> {
    /// Warehouse catalog metadata.
    Catalog(&'a [CatalogRow]),
    /// Best-effort inference from fetched values.
    Inferred {
        columns: &'a [String],
        rows: &'a [Vec<BridgeValue>],
    },
}

/// Produce column descriptors from catalog rows or a fetched sample.
pub fn parse_rows(source: ColumnSource<'_>) -> Vec<ColumnType> {
    match source {
        ColumnSource::Catalog(rows) => rows
            .iter()
            .map(|row| ColumnType::new(row.name.clone(), row.kind()))
            .collect(),
        ColumnSource::Inferred { columns, rows } => columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let first = rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .find(|value| !value.is_null());
                ColumnType::new(name.clone(), first.map(infer).unwrap_or(TypeKind::TEXT))
            })
            .collect(),
    }
}

fn infer(value: &BridgeValue) -> TypeKind {
    match value {
        BridgeValue::Int(_) => TypeKind::Integer,
        BridgeValue::Float(_) => TypeKind::Float,
        BridgeValue::Bit(_) => TypeKind::Boolean,
        BridgeValue::Binary(_) => TypeKind::Binary { length: None },
        BridgeValue::Text(_) | BridgeValue::Null => TypeKind::TEXT,
    }
}

// ==================== Type strings ====================

/// Parse a warehouse type string. Unrecognized types map to text.
pub fn parse_type(raw: &str) -> TypeKind {
    match type_spec(raw.trim()) {
        Ok((_, (name, args))) => classify(&name.to_ascii_uppercase(), &args),
        Err(_) => TypeKind::TEXT,
    }
}

/// `NAME [WORDS...] [(n [, m])]`
fn type_spec(input: &str) -> IResult<&str, (&str, Vec<u32>)> {
    let (input, name) = type_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, args) = opt(type_args)(input)?;
    Ok((input, (name, args.unwrap_or_default())))
}

fn type_name(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(
        multispace1,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn type_args(input: &str) -> IResult<&str, Vec<u32>> {
    delimited(
        char('('),
        separated_list1(
            tuple((multispace0, char(','), multispace0)),
            map_res(delimited(multispace0, digit1, multispace0), str::parse::<u32>),
        ),
        char(')'),
    )(input)
}

fn classify(name: &str, args: &[u32]) -> TypeKind {
    let arg = |i: usize| args.get(i).copied();
    // Collapse internal whitespace: "DOUBLE   PRECISION"
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    match name.as_str() {
        "NUMBER" | "DECIMAL" | "NUMERIC" | "DEC" => {
            numeric(arg(0).unwrap_or(38), arg(1).unwrap_or(0))
        }
        "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "BYTEINT" => TypeKind::Integer,
        "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "REAL" => TypeKind::Float,
        "BOOLEAN" | "BOOL" => TypeKind::Boolean,
        "DATE" => TypeKind::Date,
        "TIME" => TypeKind::Time,
        "DATETIME" | "TIMESTAMP" | "TIMESTAMP_NTZ" | "TIMESTAMPNTZ"
        | "TIMESTAMP WITHOUT TIME ZONE" => TypeKind::Timestamp,
        "TIMESTAMP_TZ" | "TIMESTAMPTZ" | "TIMESTAMP_LTZ" | "TIMESTAMPLTZ"
        | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMP WITH LOCAL TIME ZONE" => TypeKind::TimestampTz,
        "CHAR" | "CHARACTER" | "NCHAR" => TypeKind::Char {
            length: arg(0).unwrap_or(1),
        },
        "VARCHAR" | "STRING" | "TEXT" | "NVARCHAR" | "NVARCHAR2" | "CHAR VARYING"
        | "NCHAR VARYING" => TypeKind::Varchar { length: arg(0) },
        "BINARY" | "VARBINARY" => TypeKind::Binary { length: arg(0) },
        "BIT" => TypeKind::Bit,
        "ARRAY" => TypeKind::Array,
        "OBJECT" => TypeKind::Object,
        "VARIANT" => TypeKind::Variant,
        _ => TypeKind::TEXT,
    }
}

fn numeric(precision: u32, scale: u32) -> TypeKind {
    if scale == 0 {
        TypeKind::Integer
    } else {
        TypeKind::Decimal { precision, scale }
    }
}
