//! Types for statements the client left untyped
//!
//! Parameters take the declared type of the column they are inserted into or
//! compared with. Result columns SQLite cannot trace back to a table column
//! take the storage class of their first value.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Statement};
use tracing::debug;

use super::context::Column;
use crate::protocol::types::{oid, oid_for_decl_type, Oid};

static TABLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|join|into|update)\s+(?:\w+\.)?"?([A-Za-z_]\w*)"?"#)
        .expect("table pattern is valid")
});

static INSERT_COLUMNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\binto\s+[^(]+\(([^()]*)\)\s*values\s*\(([^()]*)")
        .expect("insert pattern is valid")
});

static COLUMN_THEN_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_]\w*)"?\s*(?:==?|<>|!=|<=?|>=?)\s*\$(\d+)"#)
        .expect("comparison pattern is valid")
});

static PARAM_THEN_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\$(\d+)\s*(?:==?|<>|!=|<=?|>=?)\s*(?:\w+\.)?"?([A-Za-z_]\w*)"#)
        .expect("comparison pattern is valid")
});

static IN_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([A-Za-z_]\w*)"?\s+in\s*\(([^()]*)\)"#).expect("in-list pattern is valid")
});

static LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:limit|offset)\s+\$(\d+)").expect("limit pattern is valid")
});

static PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("parameter pattern is valid"));

/// Where an untyped parameter gets its type from
#[derive(Debug, PartialEq, Eq)]
enum Source {
    Column(String),
    Fixed(Oid),
}

/// Declared column types of the tables a statement mentions
struct TableColumns(HashMap<String, Oid>);

impl TableColumns {
    fn load(conn: &Connection, sql: &str) -> Self {
        let mut columns = HashMap::new();
        for table in TABLE_REF.captures_iter(sql).map(|c| c[1].to_string()) {
            match table_columns(conn, &table) {
                Ok(found) => {
                    for (name, type_oid) in found {
                        columns.entry(name).or_insert(type_oid);
                    }
                }
                Err(e) => debug!(table = %table, error = %e, "Could not read table columns"),
            }
        }
        TableColumns(columns)
    }

    fn resolve(&self, source: &Source) -> Option<Oid> {
        match source {
            Source::Column(name) => self.0.get(&name.to_ascii_lowercase()).copied(),
            Source::Fixed(type_oid) => Some(*type_oid),
        }
    }
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, Oid)>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| {
        let name: String = row.get(0)?;
        let decl: String = row.get(1)?;
        Ok((name.to_ascii_lowercase(), oid_for_decl_type(Some(&decl))))
    })?;
    rows.collect()
}

/// Placeholder positions paired with where their type comes from
///
/// Earlier entries win: an INSERT column list is more specific than a
/// comparison elsewhere in the statement.
fn parameter_sources(sql: &str) -> Vec<(usize, Source)> {
    let mut sources = Vec::new();
    let position = |digits: &str| digits.parse::<usize>().ok();

    if let Some(insert) = INSERT_COLUMNS.captures(sql) {
        let values = insert[2].split(',').take_while(|v| !v.contains('('));
        for (column, value) in insert[1].split(',').zip(values) {
            let Some(digits) = value.trim().strip_prefix('$') else {
                continue;
            };
            if let Some(n) = position(digits) {
                let column = column.trim().trim_matches('"').to_string();
                sources.push((n, Source::Column(column)));
            }
        }
    }

    for caps in COLUMN_THEN_PARAM.captures_iter(sql) {
        if let Some(n) = position(&caps[2]) {
            sources.push((n, Source::Column(caps[1].to_string())));
        }
    }
    for caps in PARAM_THEN_COLUMN.captures_iter(sql) {
        if let Some(n) = position(&caps[1]) {
            sources.push((n, Source::Column(caps[2].to_string())));
        }
    }
    for caps in IN_LIST.captures_iter(sql) {
        for param in PARAM.captures_iter(&caps[2]) {
            if let Some(n) = position(&param[1]) {
                sources.push((n, Source::Column(caps[1].to_string())));
            }
        }
    }
    for caps in LIMIT.captures_iter(sql) {
        if let Some(n) = position(&caps[1]) {
            sources.push((n, Source::Fixed(oid::INT8)));
        }
    }

    sources
}

/// Parameter types of a statement taking `count` parameters
///
/// Types the client declared in Parse are kept. The rest are inferred from
/// the statement text and fall back to `text`.
pub(crate) fn parameter_types(
    conn: &Connection,
    sql: &str,
    count: usize,
    declared: &[Oid],
) -> Vec<Oid> {
    let mut types: Vec<Oid> = (0..count.max(declared.len()))
        .map(|i| declared.get(i).copied().unwrap_or(oid::UNSPECIFIED))
        .collect();

    if types.contains(&oid::UNSPECIFIED) {
        let tables = TableColumns::load(conn, sql);
        for (position, source) in parameter_sources(sql) {
            let Some(slot) = position.checked_sub(1).and_then(|i| types.get_mut(i)) else {
                continue;
            };
            if *slot == oid::UNSPECIFIED {
                if let Some(type_oid) = tables.resolve(&source) {
                    *slot = type_oid;
                }
            }
        }
    }

    for slot in types.iter_mut().filter(|t| **t == oid::UNSPECIFIED) {
        *slot = oid::TEXT;
    }
    types
}

/// Wire type for a value SQLite stored without a declared type
pub(crate) fn oid_for_storage_class(value: ValueRef<'_>) -> Oid {
    match value {
        ValueRef::Integer(_) => oid::INT8,
        ValueRef::Real(_) => oid::FLOAT8,
        ValueRef::Blob(_) => oid::BYTEA,
        ValueRef::Text(_) | ValueRef::Null => oid::TEXT,
    }
}

/// Type undeclared result columns of a query by its first row
///
/// Only read-only queries are run. Parameters are left unbound, which SQLite
/// treats as NULL. Columns stay `text` when the query yields no row or fails.
pub(crate) fn sample_expression_types(
    stmt: &mut Statement<'_>,
    keyword: &str,
    columns: &mut [Column],
) {
    let undeclared: Vec<usize> = stmt
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.decl_type().is_none())
        .map(|(i, _)| i)
        .collect();
    if undeclared.is_empty()
        || !stmt.readonly()
        || !matches!(keyword, "SELECT" | "VALUES" | "WITH")
    {
        return;
    }

    let mut rows = stmt.raw_query();
    let Ok(Some(row)) = rows.next() else {
        return;
    };
    for i in undeclared {
        if let (Ok(value), Some(column)) = (row.get_ref(i), columns.get_mut(i)) {
            column.type_oid = oid_for_storage_class(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orgs (id INTEGER PRIMARY KEY, name TEXT, seats INTEGER, price REAL, paid BOOLEAN);
             INSERT INTO orgs (name, seats, price, paid) VALUES ('acme', 3, 9.5, 1);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_columns_type_parameters() {
        let conn = conn();
        let types = parameter_types(
            &conn,
            "INSERT INTO orgs (name, seats, price, paid) VALUES ($1, $2, $3, $4)",
            4,
            &[],
        );
        assert_eq!(types, vec![oid::TEXT, oid::INT8, oid::FLOAT8, oid::BOOL]);
    }

    #[test]
    fn test_insert_stops_at_function_calls() {
        let conn = conn();
        let types = parameter_types(
            &conn,
            "INSERT INTO orgs (name, seats, price) VALUES (lower($1), $2, $3)",
            3,
            &[],
        );
        assert_eq!(types, vec![oid::TEXT, oid::TEXT, oid::TEXT]);
    }

    #[test]
    fn test_comparisons_type_parameters() {
        let conn = conn();
        let types = parameter_types(
            &conn,
            "SELECT name FROM orgs o WHERE o.seats >= $1 AND $2 = price \
             AND id IN ($3, $4) LIMIT $5",
            5,
            &[],
        );
        assert_eq!(
            types,
            vec![oid::INT8, oid::FLOAT8, oid::INT8, oid::INT8, oid::INT8]
        );
    }

    #[test]
    fn test_declared_and_unknown_parameters() {
        let conn = conn();
        let types = parameter_types(
            &conn,
            "UPDATE orgs SET seats = $1 WHERE name = $2 AND missing = $3",
            3,
            &[oid::INT4],
        );
        assert_eq!(types, vec![oid::INT4, oid::TEXT, oid::TEXT]);
    }

    #[test]
    fn test_expression_columns_take_storage_class() {
        let conn = conn();
        let mut stmt = conn
            .prepare("SELECT count(*), sum(price), name, 'x', x'00' FROM orgs WHERE seats > $1")
            .unwrap();
        let mut columns: Vec<Column> = stmt
            .columns()
            .iter()
            .map(|c| Column {
                name: c.name().to_string(),
                type_oid: oid_for_decl_type(c.decl_type()),
            })
            .collect();

        sample_expression_types(&mut stmt, "SELECT", &mut columns);
        let types: Vec<Oid> = columns.iter().map(|c| c.type_oid).collect();
        // sum() over no rows is NULL
        assert_eq!(
            types,
            vec![oid::INT8, oid::TEXT, oid::TEXT, oid::TEXT, oid::BYTEA]
        );
    }
}
