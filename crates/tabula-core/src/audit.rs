//! Audit trail for approved mutating executions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ApprovalId, SessionId, Timestamp};

/// Outcome of an approved execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Failed,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOutcome::Succeeded => write!(f, "succeeded"),
            AuditOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One approved statement and what happened when it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub approval_id: ApprovalId,
    pub session_id: SessionId,
    pub tool_name: String,
    pub statement: String,
    pub outcome: AuditOutcome,
    /// Result summary or error message.
    pub detail: String,
    pub executed_at: Timestamp,
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record(&self, _record: AuditRecord) {}
}
