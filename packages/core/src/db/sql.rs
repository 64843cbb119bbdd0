//! Shared SQL Plumbing
//!
//! Building blocks used by the DAOs:
//!
//! - [`SqlQuery`] - a null-skipping fragment builder: filters on `None`
//!   values are silently dropped, string filters containing `%` turn into
//!   `LIKE`, and IN lists collapse to `=` for a single element
//! - [`partition`] - chunks large id sets to respect the backend's
//!   parameter-count limits (`BATCH_SIZE` ids per statement)
//! - [`timed`] - per-statement latency logging with a slow-query threshold
//!
//! Bulk reads accumulate chunk results; bulk writes replay one prepared
//! shape per row. Neither is a flow-control device, purely backend limits.

use crate::db::error::DatabaseError;
use libsql::{params_from_iter, Connection, Rows, Value};
use std::future::Future;
use std::time::{Duration, Instant};

/// Maximum number of ids bound into a single `IN (...)` list.
pub const BATCH_SIZE: usize = 1000;

/// Statements slower than this are logged at info level.
const SLOW_QUERY: Duration = Duration::from_millis(250);

/// Split a large id set into `BATCH_SIZE` chunks.
pub(crate) fn partition(ids: &[String]) -> impl Iterator<Item = &[String]> + '_ {
    ids.chunks(BATCH_SIZE)
}

/// Run a statement future, logging its latency.
pub(crate) async fn timed<T, F>(sql: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > SLOW_QUERY {
        tracing::info!(?elapsed, sql, "slow statement");
    } else {
        tracing::debug!(sql);
    }
    out
}

/// Bind an optional string as a parameter value.
pub(crate) fn opt_text(v: Option<&str>) -> Value {
    match v {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Bind an optional integer as a parameter value.
pub(crate) fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(n) => Value::Integer(n),
        None => Value::Null,
    }
}

/// Replay one statement shape for every parameter row.
pub(crate) async fn batch_execute(
    conn: &Connection,
    sql: &str,
    batch: Vec<Vec<Value>>,
) -> Result<(), DatabaseError> {
    for row in batch {
        timed(sql, conn.execute(sql, params_from_iter(row)))
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("'{}' failed: {}", sql, e)))?;
    }
    Ok(())
}

/// Incrementally composed statement with positional parameters.
///
/// The prefix may already contain a `where` clause; further filters append
/// with `and`. Filters given `None` are skipped entirely, mirroring the
/// optional-criteria style of the DAO operations (delete an assoc by any
/// subset of type/name/source/target, and so on).
pub(crate) struct SqlQuery {
    sql: String,
    params: Vec<Value>,
    has_filter: bool,
    limit: Option<usize>,
}

impl SqlQuery {
    pub fn new(prefix: impl Into<String>) -> Self {
        let sql = prefix.into();
        let has_filter = sql.contains("where");
        Self {
            sql,
            params: Vec::new(),
            has_filter,
            limit: None,
        }
    }

    fn add_filter(&mut self) {
        self.sql
            .push_str(if self.has_filter { " and " } else { " where " });
        self.has_filter = true;
    }

    /// `set field = ?` (for UPDATE statements)
    pub fn set_int(mut self, field: &str, value: i64) -> Self {
        self.sql.push_str(" set ");
        self.sql.push_str(field);
        self.sql.push_str(" = ?");
        self.params.push(Value::Integer(value));
        self
    }

    /// Equality filter; a `%` in the value turns it into LIKE.
    pub fn filter_eq(mut self, field: &str, value: &str) -> Self {
        self.add_filter();
        self.sql.push_str(field);
        self.sql
            .push_str(if value.contains('%') { " like ?" } else { " = ?" });
        self.params.push(Value::Text(value.to_string()));
        self
    }

    /// Equality filter skipped entirely when the value is absent.
    pub fn filter_opt(self, field: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.filter_eq(field, v),
            None => self,
        }
    }

    /// Integer equality filter skipped when absent.
    pub fn filter_opt_int(mut self, field: &str, value: Option<i64>) -> Self {
        if let Some(v) = value {
            self.add_filter();
            self.sql.push_str(field);
            self.sql.push_str(" = ?");
            self.params.push(Value::Integer(v));
        }
        self
    }

    /// `field in (...)`, collapsing to `=` for a single id. Callers chunk
    /// large sets with [`partition`] first.
    pub fn filter_in(mut self, field: &str, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self;
        }
        self.add_filter();
        self.sql.push_str(field);
        if ids.len() == 1 {
            self.sql.push_str(" = ?");
        } else {
            self.sql.push_str(" in (");
            for i in 0..ids.len() {
                if i > 0 {
                    self.sql.push(',');
                }
                self.sql.push('?');
            }
            self.sql.push(')');
        }
        for id in ids {
            self.params.push(Value::Text(id.clone()));
        }
        self
    }

    /// `(f1 = ? or f2 = ? ...)` matching one value against several fields.
    pub fn filter_any(mut self, fields: &[&str], value: &str) -> Self {
        self.add_filter();
        self.sql.push('(');
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" or ");
            }
            self.sql.push_str(field);
            self.sql.push_str(" = ?");
            self.params.push(Value::Text(value.to_string()));
        }
        self.sql.push(')');
        self
    }

    /// Restrict to live (non-version) nodes.
    pub fn no_versions(mut self) -> Self {
        self.add_filter();
        self.sql.push_str("version is null");
        self
    }

    /// Restrict to version (historical snapshot) nodes.
    pub fn versions(mut self) -> Self {
        self.add_filter();
        self.sql.push_str("version is not null");
        self
    }

    /// Cap the number of returned rows; non-positive values mean unlimited.
    pub fn limit(mut self, max_rows: i64) -> Self {
        if max_rows > 0 {
            self.limit = Some(max_rows as usize);
        }
        self
    }

    fn finish(mut self) -> (String, Vec<Value>) {
        if let Some(n) = self.limit {
            self.sql.push_str(&format!(" limit {}", n));
        }
        (self.sql, self.params)
    }

    pub async fn query(self, conn: &Connection) -> Result<Rows, DatabaseError> {
        let (sql, params) = self.finish();
        timed(&sql, conn.query(&sql, params_from_iter(params)))
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("'{}' failed: {}", sql, e)))
    }

    pub async fn execute(self, conn: &Connection) -> Result<u64, DatabaseError> {
        let (sql, params) = self.finish();
        timed(&sql, conn.execute(&sql, params_from_iter(params)))
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("'{}' failed: {}", sql, e)))
    }
}
