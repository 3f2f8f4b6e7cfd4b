//! SQLite-backed execution capability.
//!
//! Statements run on the blocking pool so a slow query never stalls the
//! async runtime. SQL errors are recoverable rejections; a poisoned lock or
//! a dead worker means the engine is unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::debug;

use tabula_core::capability::{ExecutionError, QueryExecutor, QueryOutput};
use tabula_core::config::DatabaseConfig;

use crate::db::Database;
use crate::migrations::INTERNAL_TABLES;

/// Executes statements against a [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    db: Arc<Database>,
    max_rows: usize,
}

impl SqliteExecutor {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            max_rows: DatabaseConfig::DEFAULT_MAX_ROWS,
        }
    }

    /// Cap the number of rows returned per result set.
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn run_blocking<F>(&self, f: F) -> Result<QueryOutput, ExecutionError>
    where
        F: FnOnce(&Connection) -> Result<QueryOutput, ExecutionError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let joined = tokio::task::spawn_blocking(move || db.with_conn(|conn| Ok(f(conn)))).await;
        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ExecutionError::Unavailable(e.to_string())),
            Err(e) => Err(ExecutionError::Unavailable(format!(
                "execution worker failed: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, statement: &str) -> Result<QueryOutput, ExecutionError> {
        let statement = statement.trim().trim_end_matches(';').trim().to_string();
        if statement.is_empty() {
            return Err(ExecutionError::Rejected("empty statement".to_string()));
        }
        debug!(statement = %statement, "Executing statement");
        let max_rows = self.max_rows;
        self.run_blocking(move |conn| run_statement(conn, &statement, max_rows))
            .await
    }

    async fn describe(&self, table: Option<&str>) -> Result<QueryOutput, ExecutionError> {
        let table = table.map(str::to_string);
        self.run_blocking(move |conn| match table {
            Some(name) => describe_table(conn, &name),
            None => list_tables(conn),
        })
        .await
    }
}

fn rejected(err: rusqlite::Error) -> ExecutionError {
    ExecutionError::Rejected(err.to_string())
}

fn run_statement(
    conn: &Connection,
    statement: &str,
    max_rows: usize,
) -> Result<QueryOutput, ExecutionError> {
    let mut stmt = conn.prepare(statement).map_err(rejected)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute([]).map_err(rejected)?;
        return Ok(QueryOutput::affected(affected as u64));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query([]).map_err(rejected)?;
    let mut out = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(rejected)? {
        if out.len() == max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i).map_err(rejected)?));
        }
        out.push(values);
    }

    Ok(QueryOutput {
        columns,
        rows: out,
        rows_affected: None,
        truncated,
    })
}

fn list_tables(conn: &Connection) -> Result<QueryOutput, ExecutionError> {
    let output = run_statement(
        conn,
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
        usize::MAX,
    )?;
    let rows = output
        .rows
        .into_iter()
        .filter(|row| {
            row.first()
                .and_then(|v| v.as_str())
                .map(|name| !INTERNAL_TABLES.contains(&name))
                .unwrap_or(true)
        })
        .collect();
    Ok(QueryOutput::new(output.columns, rows))
}

fn describe_table(conn: &Connection, table: &str) -> Result<QueryOutput, ExecutionError> {
    if INTERNAL_TABLES.contains(&table) {
        return Err(ExecutionError::Rejected(format!("no such table: {}", table)));
    }
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(rejected)?;
    let rows = stmt
        .query_map([table], |row| {
            Ok(vec![
                to_json(row.get_ref(0)?),
                to_json(row.get_ref(1)?),
                to_json(row.get_ref(2)?),
                to_json(row.get_ref(3)?),
            ])
        })
        .map_err(rejected)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(rejected)?;

    if rows.is_empty() {
        return Err(ExecutionError::Rejected(format!("no such table: {}", table)));
    }
    Ok(QueryOutput::new(
        vec![
            "name".to_string(),
            "type".to_string(),
            "notnull".to_string(),
            "pk".to_string(),
        ],
        rows,
    ))
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}
