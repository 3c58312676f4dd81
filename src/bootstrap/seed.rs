//! Fixture seed rows
//!
//! Rows are inserted with `ON CONFLICT DO NOTHING`, so applying the same seed
//! twice leaves the tables unchanged. All rows of a set go in one transaction
//! with foreign-key checks deferred to commit, which lets a row reference
//! another row that appears later in the set.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

/// Column value of a seed row
#[derive(Debug, Clone, PartialEq)]
pub enum SeedValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// SQL expression inlined into the statement, e.g. `crypt('pw', gen_salt('bf'))`
    Expr(String),
}

impl From<&str> for SeedValue {
    fn from(s: &str) -> Self {
        SeedValue::Text(s.to_string())
    }
}

impl From<String> for SeedValue {
    fn from(s: String) -> Self {
        SeedValue::Text(s)
    }
}

impl From<i64> for SeedValue {
    fn from(i: i64) -> Self {
        SeedValue::Integer(i)
    }
}

impl From<f64> for SeedValue {
    fn from(f: f64) -> Self {
        SeedValue::Real(f)
    }
}

impl From<bool> for SeedValue {
    fn from(b: bool) -> Self {
        SeedValue::Integer(i64::from(b))
    }
}

impl<T: Into<SeedValue>> From<Option<T>> for SeedValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SeedValue::Null, Into::into)
    }
}

/// One row to insert into one table
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRow {
    pub table: String,
    pub columns: Vec<(String, SeedValue)>,
}

impl SeedRow {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<SeedValue>) -> Self {
        self.columns.push((column.into(), value.into()));
        self
    }

    pub fn expr(mut self, column: impl Into<String>, sql: impl Into<String>) -> Self {
        self.columns.push((column.into(), SeedValue::Expr(sql.into())));
        self
    }

    /// Conflict-tolerant INSERT statement and its bound parameters
    pub fn insert_sql(&self) -> (String, Vec<Value>) {
        let mut names = Vec::with_capacity(self.columns.len());
        let mut values = Vec::with_capacity(self.columns.len());
        let mut params = Vec::new();

        for (column, value) in &self.columns {
            names.push(quote_ident(column));
            match value {
                SeedValue::Expr(sql) => values.push(sql.clone()),
                SeedValue::Null => values.push("NULL".to_string()),
                SeedValue::Integer(i) => {
                    params.push(Value::Integer(*i));
                    values.push(format!("?{}", params.len()));
                }
                SeedValue::Real(f) => {
                    params.push(Value::Real(*f));
                    values.push(format!("?{}", params.len()));
                }
                SeedValue::Text(s) => {
                    params.push(Value::Text(s.clone()));
                    values.push(format!("?{}", params.len()));
                }
            }
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            quote_ident(&self.table),
            names.join(", "),
            values.join(", ")
        );
        (sql, params)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Ordered set of seed rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedSet {
    rows: Vec<SeedRow>,
}

impl SeedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(mut self, row: SeedRow) -> Self {
        self.rows.push(row);
        self
    }

    pub fn push(&mut self, row: SeedRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[SeedRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Two users linked by an invitation: alice was invited by bob
    ///
    /// Alice is listed first, so the set only applies because foreign-key
    /// checks wait for commit. Expects
    /// `users(id, email, name, password_hash, invited_by REFERENCES users(id))`.
    pub fn invited_users() -> Self {
        Self::new()
            .with_row(
                SeedRow::new("users")
                    .value("id", "alice")
                    .value("email", "alice@example.com")
                    .value("name", "Alice")
                    .expr("password_hash", "crypt('alice-password', gen_salt('bf'))")
                    .value("invited_by", "bob"),
            )
            .with_row(
                SeedRow::new("users")
                    .value("id", "bob")
                    .value("email", "bob@example.com")
                    .value("name", "Bob")
                    .expr("password_hash", "crypt('bob-password', gen_salt('bf'))")
                    .value("invited_by", SeedValue::Null),
            )
    }
}

/// Insert every row of `seed` in one transaction; returns the rows actually added
pub fn insert_seed(conn: &Connection, seed: &SeedSet) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;

    let mut inserted = 0;
    for row in seed.rows() {
        let (sql, params) = row.insert_sql();
        inserted += tx.execute(&sql, params_from_iter(params))?;
    }

    tx.commit()?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::credentials::CredentialStubs;

    const USERS: &str = "CREATE TABLE users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT,
        password_hash TEXT,
        invited_by TEXT REFERENCES users(id)
    );";

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        CredentialStubs::default().install(&conn).unwrap();
        conn.execute_batch(USERS).unwrap();
        conn
    }

    #[test]
    fn test_insert_sql_binds_literals_and_inlines_expressions() {
        let row = SeedRow::new("users")
            .value("id", "x")
            .value("age", 3i64)
            .expr("created", "CURRENT_TIMESTAMP");
        let (sql, params) = row.insert_sql();
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"id\", \"age\", \"created\") \
             VALUES (?1, ?2, CURRENT_TIMESTAMP) ON CONFLICT DO NOTHING"
        );
        assert_eq!(
            params,
            vec![Value::Text("x".to_string()), Value::Integer(3)]
        );
    }

    #[test]
    fn test_forward_reference_applies_within_one_set() {
        let conn = conn();
        assert_eq!(insert_seed(&conn, &SeedSet::invited_users()).unwrap(), 2);

        let (invited_by, hash): (String, String) = conn
            .query_row(
                "SELECT invited_by, password_hash FROM users WHERE id = 'alice'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(invited_by, "bob");
        assert_eq!(hash, "$fixture$alice-password");
    }

    #[test]
    fn test_reapplying_seed_is_a_no_op() {
        let conn = conn();
        insert_seed(&conn, &SeedSet::invited_users()).unwrap();
        assert_eq!(insert_seed(&conn, &SeedSet::invited_users()).unwrap(), 0);

        let count: i64 = conn
            .query_row("SELECT count(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_dangling_reference_fails_at_commit() {
        let conn = conn();
        let seed = SeedSet::new().with_row(
            SeedRow::new("users")
                .value("id", "carol")
                .value("email", "carol@example.com")
                .value("invited_by", "nobody"),
        );
        assert!(insert_seed(&conn, &seed).is_err());

        let count: i64 = conn
            .query_row("SELECT count(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
