//! Database schema migrations.
//!
//! Tabula keeps its own bookkeeping next to the user's tables: the
//! schema_migrations tracker and the approval_audit log.

use rusqlite::Connection;
use tracing::info;

use tabula_core::error::TabulaError;

/// Tables owned by Tabula. Hidden from schema descriptions.
pub const INTERNAL_TABLES: &[&str] = &["schema_migrations", "approval_audit"];

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), TabulaError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TabulaError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: approval_audit");
    }

    Ok(())
}

/// Version 1: approval audit log.
fn apply_v1(conn: &Connection) -> Result<(), TabulaError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS approval_audit (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            approval_id  TEXT NOT NULL UNIQUE,
            session_id   TEXT NOT NULL,
            tool_name    TEXT NOT NULL,
            statement    TEXT NOT NULL,
            outcome      TEXT NOT NULL
                         CHECK (outcome IN ('succeeded', 'failed')),
            detail       TEXT NOT NULL DEFAULT '',
            executed_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_approval_audit_executed_at
            ON approval_audit (executed_at DESC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'approval_audit');
        ",
    )
    .map_err(|e| TabulaError::Storage(format!("Migration v1 failed: {}", e)))
}
