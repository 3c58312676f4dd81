//! Conversion between SQLite values and wire representations

use rusqlite::types::{Value, ValueRef};

use super::error::{EngineError, EngineResult};
use crate::protocol::types::{oid, Format, Oid};

fn type_name(type_oid: Oid) -> &'static str {
    match type_oid {
        oid::BOOL => "boolean",
        oid::BYTEA => "bytea",
        oid::INT2 => "smallint",
        oid::INT4 => "integer",
        oid::INT8 => "bigint",
        oid::FLOAT4 => "real",
        oid::FLOAT8 => "double precision",
        oid::VARCHAR => "character varying",
        _ => "text",
    }
}

fn encode_error(type_oid: Oid, detail: impl Into<String>) -> EngineError {
    EngineError::Encode {
        type_name: type_name(type_oid),
        detail: detail.into(),
    }
}

/// Render a column value for a DataRow field; `None` is SQL NULL
pub fn encode_value(
    value: ValueRef<'_>,
    type_oid: Oid,
    format: Format,
) -> EngineResult<Option<Vec<u8>>> {
    if let ValueRef::Null = value {
        return Ok(None);
    }

    let bytes = match format {
        Format::Text => encode_text(value, type_oid),
        Format::Binary => encode_binary(value, type_oid)?,
    };
    Ok(Some(bytes))
}

fn encode_text(value: ValueRef<'_>, type_oid: Oid) -> Vec<u8> {
    match (type_oid, value) {
        (oid::BOOL, ValueRef::Integer(i)) => {
            if i != 0 {
                b"t".to_vec()
            } else {
                b"f".to_vec()
            }
        }
        (_, ValueRef::Blob(b)) => {
            let mut out = Vec::with_capacity(2 + b.len() * 2);
            out.extend_from_slice(b"\\x");
            for byte in b {
                out.extend_from_slice(format!("{:02x}", byte).as_bytes());
            }
            out
        }
        (_, ValueRef::Integer(i)) => i.to_string().into_bytes(),
        (_, ValueRef::Real(f)) => f.to_string().into_bytes(),
        (_, ValueRef::Text(t)) => t.to_vec(),
        (_, ValueRef::Null) => Vec::new(),
    }
}

fn encode_binary(value: ValueRef<'_>, type_oid: Oid) -> EngineResult<Vec<u8>> {
    match type_oid {
        oid::BOOL => Ok(vec![u8::from(as_integer(value, type_oid)? != 0)]),
        oid::INT2 => {
            let i = as_integer(value, type_oid)?;
            let narrowed = i16::try_from(i).map_err(|_| encode_error(type_oid, "value out of range"))?;
            Ok(narrowed.to_be_bytes().to_vec())
        }
        oid::INT4 => {
            let i = as_integer(value, type_oid)?;
            let narrowed = i32::try_from(i).map_err(|_| encode_error(type_oid, "value out of range"))?;
            Ok(narrowed.to_be_bytes().to_vec())
        }
        oid::INT8 => Ok(as_integer(value, type_oid)?.to_be_bytes().to_vec()),
        oid::FLOAT4 => Ok((as_real(value, type_oid)? as f32).to_be_bytes().to_vec()),
        oid::FLOAT8 => Ok(as_real(value, type_oid)?.to_be_bytes().to_vec()),
        oid::BYTEA => match value {
            ValueRef::Blob(b) | ValueRef::Text(b) => Ok(b.to_vec()),
            other => Ok(encode_text(other, oid::TEXT)),
        },
        // text-like types share their text and binary representation
        _ => Ok(encode_text(value, type_oid)),
    }
}

fn as_integer(value: ValueRef<'_>, type_oid: Oid) -> EngineResult<i64> {
    match value {
        ValueRef::Integer(i) => Ok(i),
        ValueRef::Real(f) if f.fract() == 0.0 => Ok(f as i64),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t).map_err(|e| encode_error(type_oid, e.to_string()))?;
            match s.trim() {
                "t" | "true" => Ok(1),
                "f" | "false" => Ok(0),
                other => other
                    .parse()
                    .map_err(|_| encode_error(type_oid, format!("\"{}\"", other))),
            }
        }
        other => Err(encode_error(type_oid, format!("{:?}", other.data_type()))),
    }
}

fn as_real(value: ValueRef<'_>, type_oid: Oid) -> EngineResult<f64> {
    match value {
        ValueRef::Real(f) => Ok(f),
        ValueRef::Integer(i) => Ok(i as f64),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t).map_err(|e| encode_error(type_oid, e.to_string()))?;
            s.trim()
                .parse()
                .map_err(|_| encode_error(type_oid, format!("\"{}\"", s)))
        }
        other => Err(encode_error(type_oid, format!("{:?}", other.data_type()))),
    }
}

/// Convert a Bind parameter into a value SQLite can bind
pub fn decode_param(raw: Option<&[u8]>, type_oid: Oid, format: Format) -> EngineResult<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };

    match format {
        Format::Text => decode_text_param(raw, type_oid),
        Format::Binary => decode_binary_param(raw, type_oid),
    }
}

fn decode_text_param(raw: &[u8], type_oid: Oid) -> EngineResult<Value> {
    if type_oid == oid::BYTEA {
        return decode_bytea_text(raw);
    }

    let s = std::str::from_utf8(raw).map_err(|e| encode_error(type_oid, e.to_string()))?;
    let invalid = || encode_error(type_oid, format!("\"{}\"", s));

    match type_oid {
        oid::BOOL => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "on" | "yes" | "y" => Ok(Value::Integer(1)),
            "f" | "false" | "0" | "off" | "no" | "n" => Ok(Value::Integer(0)),
            _ => Err(invalid()),
        },
        oid::INT2 | oid::INT4 | oid::INT8 => {
            s.trim().parse().map(Value::Integer).map_err(|_| invalid())
        }
        oid::FLOAT4 | oid::FLOAT8 => s.trim().parse().map(Value::Real).map_err(|_| invalid()),
        _ => Ok(Value::Text(s.to_string())),
    }
}

fn decode_bytea_text(raw: &[u8]) -> EngineResult<Value> {
    let Some(hex) = raw.strip_prefix(b"\\x") else {
        return Ok(Value::Blob(raw.to_vec()));
    };
    if hex.len() % 2 != 0 {
        return Err(encode_error(oid::BYTEA, "odd number of hex digits"));
    }

    let digit = |c: u8| -> EngineResult<u8> {
        (c as char)
            .to_digit(16)
            .map(|d| d as u8)
            .ok_or_else(|| encode_error(oid::BYTEA, format!("invalid hex digit \"{}\"", c as char)))
    };
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        out.push(digit(pair[0])? << 4 | digit(pair[1])?);
    }
    Ok(Value::Blob(out))
}

fn decode_binary_param(raw: &[u8], type_oid: Oid) -> EngineResult<Value> {
    let wrong_width = || encode_error(type_oid, format!("binary value of {} bytes", raw.len()));

    match type_oid {
        oid::BOOL => match raw {
            [b] => Ok(Value::Integer(i64::from(*b != 0))),
            _ => Err(wrong_width()),
        },
        oid::INT2 => <[u8; 2]>::try_from(raw)
            .map(|b| Value::Integer(i16::from_be_bytes(b).into()))
            .map_err(|_| wrong_width()),
        oid::INT4 => <[u8; 4]>::try_from(raw)
            .map(|b| Value::Integer(i32::from_be_bytes(b).into()))
            .map_err(|_| wrong_width()),
        oid::INT8 => <[u8; 8]>::try_from(raw)
            .map(|b| Value::Integer(i64::from_be_bytes(b)))
            .map_err(|_| wrong_width()),
        oid::FLOAT4 => <[u8; 4]>::try_from(raw)
            .map(|b| Value::Real(f32::from_be_bytes(b).into()))
            .map_err(|_| wrong_width()),
        oid::FLOAT8 => <[u8; 8]>::try_from(raw)
            .map(|b| Value::Real(f64::from_be_bytes(b)))
            .map_err(|_| wrong_width()),
        oid::BYTEA => Ok(Value::Blob(raw.to_vec())),
        _ => String::from_utf8(raw.to_vec())
            .map(Value::Text)
            .map_err(|e| encode_error(type_oid, e.to_string())),
    }
}
