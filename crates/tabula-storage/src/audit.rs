//! SQLite-backed approval audit log.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::params;
use tracing::warn;

use tabula_core::audit::{AuditOutcome, AuditRecord, AuditSink};
use tabula_core::error::TabulaError;
use tabula_core::types::{SessionId, Timestamp};

use crate::db::Database;

/// Writes audit records to the `approval_audit` table.
#[derive(Debug, Clone)]
pub struct SqliteAuditLog {
    db: Arc<Database>,
}

impl SqliteAuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert one record. A duplicate approval id is ignored.
    pub fn insert(&self, record: &AuditRecord) -> Result<(), TabulaError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO approval_audit
                    (approval_id, session_id, tool_name, statement, outcome, detail, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.approval_id.to_string(),
                    record.session_id.as_str(),
                    record.tool_name,
                    record.statement,
                    record.outcome.to_string(),
                    record.detail,
                    record.executed_at.0,
                ],
            )
            .map_err(|e| TabulaError::Storage(format!("Failed to write audit record: {}", e)))?;
            Ok(())
        })
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, TabulaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT approval_id, session_id, tool_name, statement, outcome, detail,
                            executed_at
                     FROM approval_audit ORDER BY executed_at DESC, id DESC LIMIT ?1",
                )
                .map_err(|e| TabulaError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .map_err(|e| TabulaError::Storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                let (approval_id, session_id, tool_name, statement, outcome, detail, executed_at) =
                    row.map_err(|e| TabulaError::Storage(e.to_string()))?;
                records.push(AuditRecord {
                    approval_id: approval_id.parse().map_err(TabulaError::Storage)?,
                    session_id: SessionId::from(session_id),
                    tool_name,
                    statement,
                    outcome: if outcome == "succeeded" {
                        AuditOutcome::Succeeded
                    } else {
                        AuditOutcome::Failed
                    },
                    detail,
                    executed_at: Timestamp(executed_at),
                });
            }
            Ok(records)
        })
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, record: AuditRecord) {
        let log = self.clone();
        let approval_id = record.approval_id;
        let result = tokio::task::spawn_blocking(move || log.insert(&record)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(approval_id = %approval_id, error = %e, "Audit write failed"),
            Err(e) => warn!(approval_id = %approval_id, error = %e, "Audit worker failed"),
        }
    }
}
