//! Engine error types

use rusqlite::ffi;
use thiserror::Error;

use crate::protocol::message::ErrorFields;
use crate::protocol::{sqlstate, ProtocolError};

/// Errors raised while executing frames or statements on the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Error reported by SQLite
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Frame could not be decoded
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Value could not be converted to or from its wire representation
    #[error("invalid input syntax for type {type_name}: {detail}")]
    Encode {
        type_name: &'static str,
        detail: String,
    },

    #[error("prepared statement \"{0}\" does not exist")]
    UnknownStatement(String),

    #[error("prepared statement \"{0}\" already exists")]
    DuplicateStatement(String),

    #[error("portal \"{0}\" does not exist")]
    UnknownPortal(String),

    #[error("bind message supplies {supplied} parameters, but prepared statement \"{statement}\" requires {required}")]
    ParameterCount {
        statement: String,
        supplied: usize,
        required: usize,
    },

    /// Placeholder numbered 0 or beyond the Bind parameter limit
    #[error("there is no parameter {0}")]
    UndefinedParameter(String),

    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    TransactionAborted,

    #[error("unsupported frontend message type '{0}'")]
    UnsupportedMessage(char),

    /// Engine thread is gone
    #[error("engine is not running")]
    Stopped,

    /// Engine could not open its database
    #[error("engine failed to start: {0}")]
    Startup(String),

    #[error("engine thread panicked")]
    Panicked,
}

impl EngineError {
    /// SQLSTATE reported to the client for this error
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Sqlite(e) => sqlite_sqlstate(e),
            EngineError::Protocol(_) => sqlstate::PROTOCOL_VIOLATION,
            EngineError::Encode { .. } => sqlstate::INVALID_TEXT_REPRESENTATION,
            EngineError::UnknownStatement(_) => sqlstate::INVALID_SQL_STATEMENT_NAME,
            EngineError::DuplicateStatement(_) => sqlstate::DUPLICATE_PREPARED_STATEMENT,
            EngineError::UnknownPortal(_) => sqlstate::INVALID_CURSOR_NAME,
            EngineError::ParameterCount { .. } => sqlstate::PROTOCOL_VIOLATION,
            EngineError::UndefinedParameter(_) => sqlstate::UNDEFINED_PARAMETER,
            EngineError::TransactionAborted => sqlstate::IN_FAILED_SQL_TRANSACTION,
            EngineError::UnsupportedMessage(_) => sqlstate::FEATURE_NOT_SUPPORTED,
            EngineError::Stopped | EngineError::Startup(_) | EngineError::Panicked => {
                sqlstate::INTERNAL_ERROR
            }
        }
    }

    /// Error frame fields for this error
    pub fn to_error_fields(&self) -> ErrorFields {
        ErrorFields::error(self.sqlstate(), self.to_string())
    }
}

fn sqlite_sqlstate(e: &rusqlite::Error) -> &'static str {
    let rusqlite::Error::SqliteFailure(failure, message) = e else {
        return sqlstate::INTERNAL_ERROR;
    };

    match failure.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            return sqlstate::UNIQUE_VIOLATION
        }
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return sqlstate::FOREIGN_KEY_VIOLATION,
        ffi::SQLITE_CONSTRAINT_NOTNULL => return sqlstate::NOT_NULL_VIOLATION,
        ffi::SQLITE_CONSTRAINT_CHECK => return sqlstate::CHECK_VIOLATION,
        _ => {}
    }

    let message = message.as_deref().unwrap_or_default();
    if message.contains("syntax error") || message.starts_with("incomplete input") {
        sqlstate::SYNTAX_ERROR
    } else if message.starts_with("no such table") {
        sqlstate::UNDEFINED_TABLE
    } else if message.starts_with("no such column") {
        sqlstate::UNDEFINED_COLUMN
    } else if message.starts_with("no such function") {
        sqlstate::UNDEFINED_FUNCTION
    } else if message.contains("already exists") {
        sqlstate::DUPLICATE_TABLE
    } else {
        sqlstate::INTERNAL_ERROR
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
