//! Frontend message decoding and backend message encoding

use bytes::{BufMut, BytesMut};

use super::error::{ProtocolError, ProtocolResult};
use super::frame::Frame;
use super::types::{type_size, Format, Oid};

/// Frontend (client to server) message tags
pub mod frontend {
    pub const BIND: u8 = b'B';
    pub const CLOSE: u8 = b'C';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const FLUSH: u8 = b'H';
    pub const PARSE: u8 = b'P';
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Backend (server to client) message tags
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NO_DATA: u8 = b'n';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Authentication request codes carried in `R` messages
pub mod auth_codes {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
}

/// Object addressed by Describe and Close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn from_byte(b: u8) -> ProtocolResult<Self> {
        match b {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unknown describe/close target '{}'",
                other as char
            ))),
        }
    }
}

/// Decoded frontend message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<Oid>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Describe {
        target: Target,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: Target,
        name: String,
    },
    Sync,
    Flush,
    Terminate,
    Password(String),
    Unsupported(u8),
}

impl FrontendMessage {
    /// Decode a tagged frame
    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        let mut body = BodyReader::new(frame.body());

        let message = match frame.tag() {
            frontend::QUERY => FrontendMessage::Query(body.read_cstr()?),
            frontend::PARSE => {
                let name = body.read_cstr()?;
                let query = body.read_cstr()?;
                let count = body.read_count()?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(body.read_u32()?);
                }
                FrontendMessage::Parse {
                    name,
                    query,
                    param_types,
                }
            }
            frontend::BIND => {
                let portal = body.read_cstr()?;
                let statement = body.read_cstr()?;
                let format_count = body.read_count()?;
                let mut param_formats = Vec::with_capacity(format_count);
                for _ in 0..format_count {
                    param_formats.push(body.read_i16()?);
                }
                let param_count = body.read_count()?;
                let mut params = Vec::with_capacity(param_count);
                for _ in 0..param_count {
                    let len = body.read_i32()?;
                    if len < 0 {
                        params.push(None);
                    } else {
                        params.push(Some(body.read_bytes(len as usize)?.to_vec()));
                    }
                }
                let result_count = body.read_count()?;
                let mut result_formats = Vec::with_capacity(result_count);
                for _ in 0..result_count {
                    result_formats.push(body.read_i16()?);
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            frontend::DESCRIBE => {
                let target = Target::from_byte(body.read_u8()?)?;
                FrontendMessage::Describe {
                    target,
                    name: body.read_cstr()?,
                }
            }
            frontend::EXECUTE => FrontendMessage::Execute {
                portal: body.read_cstr()?,
                max_rows: body.read_i32()?,
            },
            frontend::CLOSE => {
                let target = Target::from_byte(body.read_u8()?)?;
                FrontendMessage::Close {
                    target,
                    name: body.read_cstr()?,
                }
            }
            frontend::SYNC => FrontendMessage::Sync,
            frontend::FLUSH => FrontendMessage::Flush,
            frontend::TERMINATE => FrontendMessage::Terminate,
            frontend::PASSWORD => FrontendMessage::Password(body.read_cstr()?),
            other => return Ok(FrontendMessage::Unsupported(other)),
        };

        Ok(message)
    }
}

/// Cursor over a frame body with bounds-checked reads
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BodyReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::InvalidFrame(format!(
                "needed {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i16(&mut self) -> ProtocolResult<i16> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> ProtocolResult<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an int16 element count, rejecting negatives
    fn read_count(&mut self) -> ProtocolResult<usize> {
        let n = self.read_i16()?;
        usize::try_from(n)
            .map_err(|_| ProtocolError::InvalidFrame(format!("negative count {}", n)))
    }

    /// Read a NUL-terminated UTF-8 string
    pub fn read_cstr(&mut self) -> ProtocolResult<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::InvalidFrame("missing NUL terminator".to_string()))?;

        let s = String::from_utf8(rest[..nul].to_vec())
            .map_err(|_| ProtocolError::InvalidFrame("invalid UTF-8 in string".to_string()))?;
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Transaction status reported in ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InBlock,
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InBlock => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Column description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

impl FieldDescription {
    pub fn new(name: impl Into<String>, type_oid: Oid, format: Format) -> Self {
        FieldDescription {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: type_size(type_oid),
            type_modifier: -1,
            format,
        }
    }
}

/// Fields of an ErrorResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: &'static str,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorFields {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ErrorFields {
            severity: "ERROR",
            code: code.to_string(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        ErrorFields {
            severity: "FATAL",
            ..Self::error(code, message)
        }
    }
}

/// Backend message ready for encoding
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(Vec<Oid>),
}

impl BackendMessage {
    /// Append the encoded message to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => {
                write_message(buf, backend::AUTHENTICATION, |b| b.put_i32(auth_codes::OK))
            }
            BackendMessage::AuthenticationCleartextPassword => {
                write_message(buf, backend::AUTHENTICATION, |b| {
                    b.put_i32(auth_codes::CLEARTEXT_PASSWORD)
                })
            }
            BackendMessage::ParameterStatus { name, value } => {
                write_message(buf, backend::PARAMETER_STATUS, |b| {
                    put_cstr(b, name);
                    put_cstr(b, value);
                })
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => write_message(buf, backend::BACKEND_KEY_DATA, |b| {
                b.put_i32(*process_id);
                b.put_i32(*secret_key);
            }),
            BackendMessage::ReadyForQuery(status) => {
                write_message(buf, backend::READY_FOR_QUERY, |b| b.put_u8(status.as_byte()))
            }
            BackendMessage::RowDescription(fields) => {
                write_message(buf, backend::ROW_DESCRIPTION, |b| {
                    b.put_i16(fields.len() as i16);
                    for field in fields {
                        put_cstr(b, &field.name);
                        b.put_u32(field.table_oid);
                        b.put_i16(field.column_id);
                        b.put_u32(field.type_oid);
                        b.put_i16(field.type_size);
                        b.put_i32(field.type_modifier);
                        b.put_i16(field.format.code());
                    }
                })
            }
            BackendMessage::DataRow(values) => write_message(buf, backend::DATA_ROW, |b| {
                b.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        Some(bytes) => {
                            b.put_i32(bytes.len() as i32);
                            b.put_slice(bytes);
                        }
                        None => b.put_i32(-1),
                    }
                }
            }),
            BackendMessage::CommandComplete(tag) => {
                write_message(buf, backend::COMMAND_COMPLETE, |b| put_cstr(b, tag))
            }
            BackendMessage::EmptyQueryResponse => {
                write_message(buf, backend::EMPTY_QUERY_RESPONSE, |_| {})
            }
            BackendMessage::ErrorResponse(fields) => {
                write_message(buf, backend::ERROR_RESPONSE, |b| {
                    b.put_u8(b'S');
                    put_cstr(b, fields.severity);
                    b.put_u8(b'V');
                    put_cstr(b, fields.severity);
                    b.put_u8(b'C');
                    put_cstr(b, &fields.code);
                    b.put_u8(b'M');
                    put_cstr(b, &fields.message);
                    if let Some(detail) = &fields.detail {
                        b.put_u8(b'D');
                        put_cstr(b, detail);
                    }
                    b.put_u8(0);
                })
            }
            BackendMessage::ParseComplete => write_message(buf, backend::PARSE_COMPLETE, |_| {}),
            BackendMessage::BindComplete => write_message(buf, backend::BIND_COMPLETE, |_| {}),
            BackendMessage::CloseComplete => write_message(buf, backend::CLOSE_COMPLETE, |_| {}),
            BackendMessage::NoData => write_message(buf, backend::NO_DATA, |_| {}),
            BackendMessage::PortalSuspended => {
                write_message(buf, backend::PORTAL_SUSPENDED, |_| {})
            }
            BackendMessage::ParameterDescription(types) => {
                write_message(buf, backend::PARAMETER_DESCRIPTION, |b| {
                    b.put_i16(types.len() as i16);
                    for t in types {
                        b.put_u32(*t);
                    }
                })
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }
}

/// Write tag, a placeholder length, the body, then patch the length
fn write_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
