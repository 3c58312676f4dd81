//! Wire protocol error types

use std::fmt;
use std::io;

/// Frame-level protocol errors
#[derive(Debug)]
pub enum ProtocolError {
    /// I/O error during read/write
    Io(io::Error),
    /// Frame header or body does not follow the protocol layout
    InvalidFrame(String),
    /// Declared frame length exceeds the configured maximum
    FrameTooLarge { size: usize, max: usize },
    /// Request the bridge does not implement
    Unsupported(String),
    /// Connection closed by client
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
            ProtocolError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            ProtocolError::FrameTooLarge { size, max } => {
                write!(f, "Frame of {} bytes exceeds maximum of {} bytes", size, max)
            }
            ProtocolError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            ProtocolError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// SQLSTATE codes reported in error frames
pub mod sqlstate {
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
    pub const INVALID_CURSOR_NAME: &str = "34000";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const UNDEFINED_FUNCTION: &str = "42883";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_PARAMETER: &str = "42P02";
    pub const DUPLICATE_PREPARED_STATEMENT: &str = "42P05";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const CANNOT_CONNECT_NOW: &str = "57P03";
    pub const INTERNAL_ERROR: &str = "XX000";
}
