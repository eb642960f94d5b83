//! Column type descriptors.
//!
//! - `codec` - host value <-> bridge value translation
//! - `parser` - warehouse type strings and result-set inference
//! - `cache` - statement fingerprint -> descriptors

pub mod cache;
pub mod codec;
pub mod parser;

use std::fmt;

pub use cache::{CacheStats, Resolved, TypeCache};
pub use codec::{decode, encode};
pub use parser::{CatalogRow, ColumnSource, parse_rows, parse_type};

/// Semantic type of a column, with the metadata decoding needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// NUMBER with zero scale.
    Integer,
    /// NUMBER(p, s) with s > 0.
    Decimal { precision: u32, scale: u32 },
    Float,
    Boolean,
    Date,
    Time,
    /// TIMESTAMP_NTZ
    Timestamp,
    /// TIMESTAMP_TZ / TIMESTAMP_LTZ
    TimestampTz,
    Char { length: u32 },
    /// VARCHAR / STRING / TEXT. `None` means the warehouse maximum.
    Varchar { length: Option<u32> },
    Binary { length: Option<u32> },
    Bit,
    Array,
    Object,
    /// Semi-structured value of any shape.
    Variant,
}

impl TypeKind {
    /// Plain text, the fallback for anything not otherwise recognized.
    pub const TEXT: TypeKind = TypeKind::Varchar { length: None };

    pub fn is_textual(&self) -> bool {
        matches!(self, TypeKind::Char { .. } | TypeKind::Varchar { .. })
    }

    pub fn is_semi_structured(&self) -> bool {
        matches!(self, TypeKind::Array | TypeKind::Object | TypeKind::Variant)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Integer => write!(f, "NUMBER(38,0)"),
            TypeKind::Decimal { precision, scale } => write!(f, "NUMBER({},{})", precision, scale),
            TypeKind::Float => write!(f, "FLOAT"),
            TypeKind::Boolean => write!(f, "BOOLEAN"),
            TypeKind::Date => write!(f, "DATE"),
            TypeKind::Time => write!(f, "TIME"),
            TypeKind::Timestamp => write!(f, "TIMESTAMP_NTZ"),
            TypeKind::TimestampTz => write!(f, "TIMESTAMP_TZ"),
            TypeKind::Char { length } => write!(f, "CHAR({})", length),
            TypeKind::Varchar { length: Some(n) } => write!(f, "VARCHAR({})", n),
            TypeKind::Varchar { length: None } => write!(f, "VARCHAR"),
            TypeKind::Binary { length: Some(n) } => write!(f, "BINARY({})", n),
            TypeKind::Binary { length: None } => write!(f, "BINARY"),
            TypeKind::Bit => write!(f, "BIT"),
            TypeKind::Array => write!(f, "ARRAY"),
            TypeKind::Object => write!(f, "OBJECT"),
            TypeKind::Variant => write!(f, "VARIANT"),
        }
    }
}

/// One result column: its name and resolved type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnType {
    pub name: String,
    pub kind: TypeKind,
}

impl ColumnType {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parses_back() {
        for kind in [
            TypeKind::Integer,
            TypeKind::Decimal { precision: 10, scale: 2 },
            TypeKind::Float,
            TypeKind::Boolean,
            TypeKind::TimestampTz,
            TypeKind::Char { length: 3 },
            TypeKind::TEXT,
            TypeKind::Binary { length: Some(16) },
            TypeKind::Object,
        ] {
            assert_eq!(parse_type(&kind.to_string()), kind);
        }
    }
}
