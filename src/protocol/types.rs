//! Type identifiers and value formats

use super::error::{ProtocolError, ProtocolResult};

/// PostgreSQL type OID
pub type Oid = u32;

/// Builtin type OIDs reported in row and parameter descriptions
pub mod oid {
    use super::Oid;

    pub const UNSPECIFIED: Oid = 0;
    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
}

/// Wire size of a fixed-width type, -1 for variable width
pub fn type_size(type_oid: Oid) -> i16 {
    match type_oid {
        oid::BOOL => 1,
        oid::INT2 => 2,
        oid::INT4 | oid::FLOAT4 => 4,
        oid::INT8 | oid::FLOAT8 => 8,
        _ => -1,
    }
}

/// Map a declared column type to the OID reported to clients
///
/// Follows SQLite's affinity rules closely enough that a column declared
/// `INTEGER`, `BIGINT` or `INT4` is reported as `int8`, since every SQLite
/// integer is 64-bit.
pub fn oid_for_decl_type(decl: Option<&str>) -> Oid {
    let Some(decl) = decl else {
        return oid::TEXT;
    };
    let upper = decl.to_ascii_uppercase();

    if upper.starts_with("BOOL") {
        oid::BOOL
    } else if upper.contains("INT") {
        oid::INT8
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        oid::FLOAT8
    } else if upper.contains("BLOB") || upper.contains("BYTEA") {
        oid::BYTEA
    } else {
        oid::TEXT
    }
}

/// Value format code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

impl Format {
    pub fn from_code(code: i16) -> ProtocolResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unknown format code {}",
                other
            ))),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

/// Expand a list of format codes to one format per value
///
/// Zero codes means all text, one code applies to every value, otherwise there
/// must be exactly one code per value.
pub fn expand_formats(codes: &[i16], count: usize) -> ProtocolResult<Vec<Format>> {
    match codes.len() {
        0 => Ok(vec![Format::Text; count]),
        1 => Ok(vec![Format::from_code(codes[0])?; count]),
        n if n == count => codes.iter().map(|c| Format::from_code(*c)).collect(),
        n => Err(ProtocolError::InvalidFrame(format!(
            "{} format codes supplied for {} values",
            n, count
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decl_type_mapping() {
        assert_eq!(oid_for_decl_type(Some("INTEGER")), oid::INT8);
        assert_eq!(oid_for_decl_type(Some("bigint")), oid::INT8);
        assert_eq!(oid_for_decl_type(Some("BOOLEAN")), oid::BOOL);
        assert_eq!(oid_for_decl_type(Some("double precision")), oid::FLOAT8);
        assert_eq!(oid_for_decl_type(Some("BLOB")), oid::BYTEA);
        assert_eq!(oid_for_decl_type(Some("TIMESTAMPTZ")), oid::TEXT);
        assert_eq!(oid_for_decl_type(None), oid::TEXT);
    }

    #[test]
    fn test_expand_formats() {
        assert_eq!(expand_formats(&[], 2).unwrap(), vec![Format::Text; 2]);
        assert_eq!(expand_formats(&[1], 3).unwrap(), vec![Format::Binary; 3]);
        assert_eq!(
            expand_formats(&[0, 1], 2).unwrap(),
            vec![Format::Text, Format::Binary]
        );
        assert!(expand_formats(&[0, 1], 3).is_err());
        assert!(expand_formats(&[7], 1).is_err());
    }
}
