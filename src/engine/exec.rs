//! Frame execution against the embedded database
//!
//! `EngineState` owns the SQLite connection and the execution context of every
//! bridged connection. Each call to [`EngineState::handle_frame`] consumes one
//! complete frontend frame and returns the encoded backend reply, which may be
//! empty (Flush, or anything discarded while waiting for Sync).

use std::collections::HashMap;

use bytes::BytesMut;
use rusqlite::types::Value;
use rusqlite::{Batch, Connection, Statement};
use tracing::debug;

use super::context::{
    Column, ContextId, ExecutionContext, PendingRows, Portal, PreparedStatement,
};
use super::error::{EngineError, EngineResult};
use super::infer::{parameter_types, sample_expression_types};
use super::types::{decode_param, encode_value};
use crate::protocol::message::{frontend, FieldDescription, Target};
use crate::protocol::types::{expand_formats, oid_for_decl_type, Format};
use crate::protocol::{BackendMessage, Frame, FrontendMessage, TransactionStatus};

/// Database connection plus the per-connection protocol state layered on it
pub(crate) struct EngineState {
    conn: Connection,
    contexts: HashMap<ContextId, ExecutionContext>,
    txn_failed: bool,
}

impl EngineState {
    pub fn new(conn: Connection) -> Self {
        EngineState {
            conn,
            contexts: HashMap::new(),
            txn_failed: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Drop a connection's statements and portals
    pub fn release(&mut self, context: ContextId) {
        if self.contexts.remove(&context).is_some() {
            debug!(context, "Released execution context");
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Execute one frontend frame and return the encoded reply
    pub fn handle_frame(&mut self, context: ContextId, raw: Vec<u8>) -> Vec<u8> {
        let EngineState {
            conn,
            contexts,
            txn_failed,
        } = self;
        let ctx = contexts.entry(context).or_default();

        let mut out = BytesMut::new();
        let mut executor = Executor {
            conn,
            txn_failed,
            out: &mut out,
        };
        executor.dispatch(ctx, raw);
        out.to_vec()
    }

    /// Reply for a frame whose execution panicked
    ///
    /// The connection's statements and portals are dropped. After an
    /// extended-protocol frame the connection skips to the next Sync, as it
    /// does after any other error.
    pub fn recover(&mut self, context: ContextId, tag: Option<u8>) -> Vec<u8> {
        self.release(context);
        let EngineState {
            conn,
            contexts,
            txn_failed,
        } = self;
        let ctx = contexts.entry(context).or_default();

        let mut out = BytesMut::new();
        let mut executor = Executor {
            conn,
            txn_failed,
            out: &mut out,
        };
        if tag.is_some_and(is_extended) {
            executor.fail_extended(ctx, EngineError::Panicked);
        } else {
            executor.fail_simple(EngineError::Panicked);
        }
        out.to_vec()
    }

    pub fn close(self) -> EngineResult<()> {
        self.conn.close().map_err(|(_, e)| EngineError::Sqlite(e))
    }
}

/// How a statement interacts with the current transaction block
enum Gate {
    Run,
    /// Report the tag without touching the database
    Skip(&'static str),
    /// Run a different statement and report its tag
    Replace {
        sql: &'static str,
        tag: &'static str,
    },
}

struct StatementOutcome {
    rows: Vec<Vec<Option<Vec<u8>>>>,
    tag: String,
}

struct Executor<'a> {
    conn: &'a Connection,
    txn_failed: &'a mut bool,
    out: &'a mut BytesMut,
}

impl Executor<'_> {
    fn push(&mut self, message: BackendMessage) {
        message.encode(self.out);
    }

    fn dispatch(&mut self, ctx: &mut ExecutionContext, raw: Vec<u8>) {
        let frame = match Frame::from_raw(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail_simple(e.into());
                return;
            }
        };

        let message = match FrontendMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                if is_extended(frame.tag()) {
                    self.fail_extended(ctx, e.into());
                } else {
                    self.fail_simple(e.into());
                }
                return;
            }
        };

        let result = match message {
            FrontendMessage::Query(sql) => {
                if let Err(e) = self.simple_query(&sql) {
                    self.report(e);
                }
                self.ready();
                return;
            }
            FrontendMessage::Sync => {
                ctx.discard_until_sync = false;
                self.ready();
                return;
            }
            FrontendMessage::Flush | FrontendMessage::Terminate => return,
            FrontendMessage::Password(_) => {
                self.fail_simple(EngineError::UnsupportedMessage(frontend::PASSWORD as char));
                return;
            }
            FrontendMessage::Unsupported(tag) => {
                self.fail_simple(EngineError::UnsupportedMessage(tag as char));
                return;
            }
            _ if ctx.discard_until_sync => return,
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => self.parse(ctx, name, query, param_types),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => self.bind(ctx, portal, &statement, &param_formats, params, &result_formats),
            FrontendMessage::Describe { target, name } => self.describe(ctx, target, &name),
            FrontendMessage::Execute { portal, max_rows } => self.execute(ctx, &portal, max_rows),
            FrontendMessage::Close { target, name } => {
                match target {
                    Target::Statement => ctx.close_statement(&name),
                    Target::Portal => ctx.close_portal(&name),
                }
                self.push(BackendMessage::CloseComplete);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail_extended(ctx, e);
        }
    }

    /// Error outside the extended protocol: reply and return to idle
    fn fail_simple(&mut self, e: EngineError) {
        self.report(e);
        self.ready();
    }

    /// Error inside the extended protocol: reply and skip to the next Sync
    fn fail_extended(&mut self, ctx: &mut ExecutionContext, e: EngineError) {
        self.report(e);
        ctx.discard_until_sync = true;
    }

    fn report(&mut self, e: EngineError) {
        debug!(error = %e, sqlstate = e.sqlstate(), "Statement failed");
        if !self.conn.is_autocommit() {
            *self.txn_failed = true;
        }
        self.push(BackendMessage::ErrorResponse(e.to_error_fields()));
    }

    fn status(&mut self) -> TransactionStatus {
        if self.conn.is_autocommit() {
            *self.txn_failed = false;
            TransactionStatus::Idle
        } else if *self.txn_failed {
            TransactionStatus::Failed
        } else {
            TransactionStatus::InBlock
        }
    }

    fn ready(&mut self) {
        let status = self.status();
        self.push(BackendMessage::ReadyForQuery(status));
    }

    fn gate(&self, keyword: &str) -> EngineResult<Gate> {
        let in_block = !self.conn.is_autocommit();

        if in_block && *self.txn_failed {
            return match keyword {
                "ROLLBACK" => Ok(Gate::Run),
                "COMMIT" | "END" => Ok(Gate::Replace {
                    sql: "ROLLBACK",
                    tag: "ROLLBACK",
                }),
                _ => Err(EngineError::TransactionAborted),
            };
        }

        Ok(match keyword {
            "BEGIN" if in_block => Gate::Skip("BEGIN"),
            "COMMIT" | "END" if !in_block => Gate::Skip("COMMIT"),
            "ROLLBACK" if !in_block => Gate::Skip("ROLLBACK"),
            _ => Gate::Run,
        })
    }

    fn simple_query(&mut self, sql: &str) -> EngineResult<()> {
        if let Some(tag) = session_command_tag(sql) {
            self.push(BackendMessage::CommandComplete(tag));
            return Ok(());
        }

        let conn = self.conn;
        let mut batch = Batch::new(conn, sql);
        let mut ran_any = false;

        while let Some(mut stmt) = batch.next()? {
            ran_any = true;
            let text = stmt.expanded_sql().unwrap_or_default();
            let keyword = leading_keyword(&text);

            match self.gate(&keyword)? {
                Gate::Run => {}
                Gate::Skip(tag) => {
                    self.push(BackendMessage::CommandComplete(tag.to_string()));
                    continue;
                }
                Gate::Replace { sql, tag } => {
                    conn.execute_batch(sql)?;
                    *self.txn_failed = false;
                    self.push(BackendMessage::CommandComplete(tag.to_string()));
                    continue;
                }
            }

            let mut columns = describe_columns(&stmt);
            sample_expression_types(&mut stmt, &keyword, &mut columns);
            if !columns.is_empty() {
                let fields = columns
                    .iter()
                    .map(|c| FieldDescription::new(c.name.clone(), c.type_oid, Format::Text))
                    .collect();
                self.push(BackendMessage::RowDescription(fields));
            }

            let formats = vec![Format::Text; columns.len()];
            let outcome = run_statement(conn, &mut stmt, &text, &columns, &formats)?;
            if keyword == "ROLLBACK" {
                *self.txn_failed = false;
            }
            for row in outcome.rows {
                self.push(BackendMessage::DataRow(row));
            }
            self.push(BackendMessage::CommandComplete(outcome.tag));
        }

        if !ran_any {
            self.push(BackendMessage::EmptyQueryResponse);
        }
        Ok(())
    }

    fn parse(
        &mut self,
        ctx: &mut ExecutionContext,
        name: String,
        query: String,
        declared: Vec<u32>,
    ) -> EngineResult<()> {
        let (count, columns) = if query.trim().is_empty() || session_command_tag(&query).is_some()
        {
            (0, Vec::new())
        } else {
            let mut stmt = self.conn.prepare(&query)?;
            let count = parameter_count(&stmt)?;
            let mut columns = describe_columns(&stmt);
            sample_expression_types(&mut stmt, &leading_keyword(&query), &mut columns);
            (count, columns)
        };

        let param_types = parameter_types(self.conn, &query, count, &declared);

        ctx.add_statement(
            name,
            PreparedStatement {
                sql: query,
                param_types,
                columns,
            },
        )?;
        self.push(BackendMessage::ParseComplete);
        Ok(())
    }

    fn bind(
        &mut self,
        ctx: &mut ExecutionContext,
        portal: String,
        statement_name: &str,
        param_formats: &[i16],
        params: Vec<Option<Vec<u8>>>,
        result_formats: &[i16],
    ) -> EngineResult<()> {
        let statement = ctx.statement(statement_name)?;
        if params.len() != statement.param_types.len() {
            return Err(EngineError::ParameterCount {
                statement: statement_name.to_string(),
                supplied: params.len(),
                required: statement.param_types.len(),
            });
        }

        let formats = expand_formats(param_formats, params.len())?;
        let values = params
            .iter()
            .zip(&statement.param_types)
            .zip(formats)
            .map(|((raw, type_oid), format)| decode_param(raw.as_deref(), *type_oid, format))
            .collect::<EngineResult<Vec<Value>>>()?;
        let result_formats = expand_formats(result_formats, statement.columns.len())?;

        ctx.add_portal(
            portal,
            Portal {
                statement,
                params: values,
                result_formats,
                pending: None,
            },
        );
        self.push(BackendMessage::BindComplete);
        Ok(())
    }

    fn describe(
        &mut self,
        ctx: &mut ExecutionContext,
        target: Target,
        name: &str,
    ) -> EngineResult<()> {
        let (statement, formats) = match target {
            Target::Statement => {
                let statement = ctx.statement(name)?;
                self.push(BackendMessage::ParameterDescription(
                    statement.param_types.clone(),
                ));
                (statement, Vec::new())
            }
            Target::Portal => {
                let portal = ctx.portal(name)?;
                (portal.statement.clone(), portal.result_formats.clone())
            }
        };

        if statement.columns.is_empty() {
            self.push(BackendMessage::NoData);
        } else {
            self.push(BackendMessage::RowDescription(statement.fields(&formats)));
        }
        Ok(())
    }

    fn execute(
        &mut self,
        ctx: &mut ExecutionContext,
        portal_name: &str,
        max_rows: i32,
    ) -> EngineResult<()> {
        let portal = ctx.portal_mut(portal_name)?;
        if portal.statement.is_empty() {
            self.push(BackendMessage::EmptyQueryResponse);
            return Ok(());
        }

        if portal.pending.is_none() {
            portal.pending = Some(self.run_portal(portal)?);
        }
        let Some(pending) = portal.pending.as_mut() else {
            return Ok(());
        };

        let limit = usize::try_from(max_rows)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(usize::MAX);
        let mut sent = 0;
        while sent < limit {
            let Some(row) = pending.rows.pop_front() else {
                break;
            };
            self.push(BackendMessage::DataRow(row));
            sent += 1;
        }

        if pending.rows.is_empty() {
            let tag = pending.tag.clone();
            self.push(BackendMessage::CommandComplete(tag));
        } else {
            self.push(BackendMessage::PortalSuspended);
        }
        Ok(())
    }

    fn run_portal(&mut self, portal: &Portal) -> EngineResult<PendingRows> {
        let sql = portal.statement.sql.as_str();
        if let Some(tag) = session_command_tag(sql) {
            return Ok(PendingRows {
                rows: Default::default(),
                tag,
            });
        }

        let keyword = leading_keyword(sql);
        let tag = match self.gate(&keyword)? {
            Gate::Run => None,
            Gate::Skip(tag) => Some(tag),
            Gate::Replace { sql, tag } => {
                self.conn.execute_batch(sql)?;
                *self.txn_failed = false;
                Some(tag)
            }
        };
        if let Some(tag) = tag {
            return Ok(PendingRows {
                rows: Default::default(),
                tag: tag.to_string(),
            });
        }

        let mut stmt = self.conn.prepare(sql)?;
        bind_parameters(&mut stmt, &portal.params)?;
        let outcome = run_statement(
            self.conn,
            &mut stmt,
            sql,
            &portal.statement.columns,
            &portal.result_formats,
        )?;
        if keyword == "ROLLBACK" {
            *self.txn_failed = false;
        }

        Ok(PendingRows {
            rows: outcome.rows.into(),
            tag: outcome.tag,
        })
    }
}

fn is_extended(tag: u8) -> bool {
    matches!(
        tag,
        frontend::PARSE | frontend::BIND | frontend::DESCRIBE | frontend::EXECUTE | frontend::CLOSE
    )
}

fn describe_columns(stmt: &Statement<'_>) -> Vec<Column> {
    stmt.columns()
        .iter()
        .map(|c| Column {
            name: c.name().to_string(),
            type_oid: oid_for_decl_type(c.decl_type()),
        })
        .collect()
}

/// Most parameters a Bind message can carry
const MAX_PARAMETERS: usize = u16::MAX as usize;

/// Position of a placeholder in the Bind parameter list
///
/// `$N` and `?N` placeholders name their position, which must lie in
/// `1..=MAX_PARAMETERS`. Anonymous `?` and named placeholders take their
/// index.
fn parameter_position(name: Option<&str>, index: usize) -> EngineResult<usize> {
    let Some(name) = name else {
        return Ok(index);
    };
    let digits = name
        .strip_prefix('$')
        .or_else(|| name.strip_prefix('?'))
        .unwrap_or_default();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(index);
    }

    match digits.parse::<usize>() {
        Ok(position) if (1..=MAX_PARAMETERS).contains(&position) => Ok(position),
        _ => Err(EngineError::UndefinedParameter(name.to_string())),
    }
}

/// Number of Bind parameters a statement takes: its highest placeholder
fn parameter_count(stmt: &Statement<'_>) -> EngineResult<usize> {
    let mut count = 0;
    for index in 1..=stmt.parameter_count() {
        count = count.max(parameter_position(stmt.parameter_name(index), index)?);
    }
    Ok(count)
}

fn bind_parameters(stmt: &mut Statement<'_>, params: &[Value]) -> EngineResult<()> {
    for index in 1..=stmt.parameter_count() {
        let position = parameter_position(stmt.parameter_name(index), index)?;
        let value = position
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .unwrap_or(&Value::Null);
        stmt.raw_bind_parameter(index, value)?;
    }
    Ok(())
}

fn run_statement(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    sql: &str,
    columns: &[Column],
    formats: &[Format],
) -> EngineResult<StatementOutcome> {
    let mut data = Vec::new();
    {
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let format = formats.get(i).copied().unwrap_or_default();
                values.push(encode_value(row.get_ref(i)?, column.type_oid, format)?);
            }
            data.push(values);
        }
    }

    let changes = if stmt.readonly() { 0 } else { conn.changes() as u64 };
    let tag = command_tag(sql, !columns.is_empty(), data.len() as u64, changes);
    Ok(StatementOutcome { rows: data, tag })
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return rest;
        }
    }
}

fn keywords(sql: &str) -> impl Iterator<Item = String> + '_ {
    strip_leading_comments(sql).split_whitespace().map(|word| {
        word.chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase()
    })
}

/// First keyword of a statement, upper-cased
pub(crate) fn leading_keyword(sql: &str) -> String {
    keywords(sql).next().unwrap_or_default()
}

/// Session commands SQLite has no counterpart for; they succeed without effect
fn session_command_tag(sql: &str) -> Option<String> {
    let keyword = leading_keyword(sql);
    matches!(keyword.as_str(), "SET" | "RESET" | "DISCARD").then_some(keyword)
}

/// CommandComplete tag for a finished statement
pub(crate) fn command_tag(sql: &str, has_columns: bool, rows: u64, changes: u64) -> String {
    let mut words = keywords(sql).filter(|w| !w.is_empty());
    let Some(first) = words.next() else {
        return String::new();
    };

    match first.as_str() {
        "INSERT" | "REPLACE" => format!("INSERT 0 {}", changes),
        "UPDATE" => format!("UPDATE {}", changes),
        "DELETE" => format!("DELETE {}", changes),
        _ if has_columns => format!("SELECT {}", rows),
        "CREATE" | "DROP" | "ALTER" => {
            let object = words.find(|w| {
                !matches!(
                    w.as_str(),
                    "TEMP" | "TEMPORARY" | "UNIQUE" | "VIRTUAL" | "OR" | "REPLACE"
                )
            });
            match object {
                Some(object) => format!("{} {}", first, object),
                None => first,
            }
        }
        "BEGIN" => "BEGIN".to_string(),
        "COMMIT" | "END" => "COMMIT".to_string(),
        _ => first,
    }
}
