//! Per-connection execution context
//!
//! Holds the extended-query state one client connection builds up: named
//! prepared statements, bound portals, and whether the connection is
//! discarding messages until the next Sync after an error.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rusqlite::types::Value;

use super::error::{EngineError, EngineResult};
use crate::protocol::message::FieldDescription;
use crate::protocol::types::{Format, Oid};

/// Identifies the execution context of one bridged connection
pub type ContextId = u32;

/// Result column of a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

/// Statement created by a Parse message
#[derive(Debug)]
pub struct PreparedStatement {
    pub sql: String,
    pub param_types: Vec<Oid>,
    pub columns: Vec<Column>,
}

impl PreparedStatement {
    /// Whether the statement text contains nothing to execute
    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    /// Row description using the given per-column formats
    pub fn fields(&self, formats: &[Format]) -> Vec<FieldDescription> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let format = formats.get(i).copied().unwrap_or_default();
                FieldDescription::new(c.name.clone(), c.type_oid, format)
            })
            .collect()
    }
}

/// Rows produced by a portal but not yet sent to the client
#[derive(Debug)]
pub struct PendingRows {
    pub rows: VecDeque<Vec<Option<Vec<u8>>>>,
    pub tag: String,
}

/// Statement bound to parameter values by a Bind message
#[derive(Debug)]
pub struct Portal {
    pub statement: Rc<PreparedStatement>,
    pub params: Vec<Value>,
    pub result_formats: Vec<Format>,
    /// Materialized on first Execute, drained across suspended Executes
    pub pending: Option<PendingRows>,
}

/// Extended-query state of one connection
#[derive(Debug, Default)]
pub struct ExecutionContext {
    statements: HashMap<String, Rc<PreparedStatement>>,
    portals: HashMap<String, Portal>,
    /// Set after an error; cleared by Sync
    pub discard_until_sync: bool,
}

impl ExecutionContext {
    /// Register a prepared statement; the unnamed statement is silently replaced
    pub fn add_statement(&mut self, name: String, statement: PreparedStatement) -> EngineResult<()> {
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(EngineError::DuplicateStatement(name));
        }
        self.statements.insert(name, Rc::new(statement));
        Ok(())
    }

    pub fn statement(&self, name: &str) -> EngineResult<Rc<PreparedStatement>> {
        self.statements
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStatement(name.to_string()))
    }

    /// Register a portal, replacing any portal of the same name
    pub fn add_portal(&mut self, name: String, portal: Portal) {
        self.portals.insert(name, portal);
    }

    pub fn portal(&self, name: &str) -> EngineResult<&Portal> {
        self.portals
            .get(name)
            .ok_or_else(|| EngineError::UnknownPortal(name.to_string()))
    }

    pub fn portal_mut(&mut self, name: &str) -> EngineResult<&mut Portal> {
        self.portals
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownPortal(name.to_string()))
    }

    /// Closing a name that does not exist is not an error
    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}
