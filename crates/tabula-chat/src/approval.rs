//! Approval store: pending mutating actions and their suspended continuations.
//!
//! Resolution is a claim. The first caller atomically moves a request from
//! `pending` to a terminal status and receives the continuation; every later
//! caller sees `AlreadyResolved`. The record stays behind as a tombstone
//! until pruned, so late duplicates never execute anything.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use tabula_core::types::{ApprovalId, ApprovalStatus, Decision, SessionId, Timestamp};

use crate::admin::Continuation;
use crate::error::ApprovalError;

/// Public view of an approval request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSummary {
    pub approval_id: ApprovalId,
    pub session_id: SessionId,
    pub tool_name: String,
    pub proposed_action: String,
    pub explanation: String,
    pub status: ApprovalStatus,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

/// Input for [`ApprovalStore::create`].
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub session_id: SessionId,
    pub tool_name: String,
    pub proposed_action: String,
    pub explanation: String,
    pub continuation: Continuation,
}

/// A successfully claimed approval, ready to be resumed.
#[derive(Debug, Clone)]
pub struct ClaimedApproval {
    pub summary: ApprovalSummary,
    pub decision: Decision,
    pub continuation: Continuation,
}

/// Storage for approval requests.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Store a new pending request.
    async fn create(&self, request: NewApproval) -> ApprovalSummary;

    /// Atomically move a pending request to the decision's terminal status
    /// and hand over its continuation.
    async fn claim(
        &self,
        approval_id: &ApprovalId,
        decision: Decision,
    ) -> Result<ClaimedApproval, ApprovalError>;

    async fn get(&self, approval_id: &ApprovalId) -> Option<ApprovalSummary>;

    /// Pending requests, oldest first.
    async fn pending(&self) -> Vec<ApprovalSummary>;

    /// Abandon pending requests older than `ttl_secs`.
    async fn expire(&self, now: Timestamp, ttl_secs: u64) -> Vec<ApprovalSummary>;

    /// Abandon every pending request owned by a session.
    async fn abandon_session(&self, session_id: &SessionId) -> Vec<ApprovalSummary>;

    /// Drop terminal records resolved at least `retain_secs` ago.
    async fn prune(&self, now: Timestamp, retain_secs: u64) -> usize;

    async fn close(&self) {}
}

struct ApprovalRecord {
    summary: ApprovalSummary,
    /// Taken on claim; `None` for every terminal record.
    continuation: Option<Continuation>,
}

/// Process-local approval store guarded by a single mutex.
///
/// The lock is only held for map operations, never across an await.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    records: Mutex<HashMap<ApprovalId, ApprovalRecord>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ApprovalId, ApprovalRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn abandon_where<F>(&self, now: Timestamp, predicate: F) -> Vec<ApprovalSummary>
    where
        F: Fn(&ApprovalSummary) -> bool,
    {
        let mut records = self.records();
        let mut abandoned = Vec::new();
        for record in records.values_mut() {
            if record.summary.status == ApprovalStatus::Pending && predicate(&record.summary) {
                record.summary.status = ApprovalStatus::Abandoned;
                record.summary.resolved_at = Some(now);
                record.continuation = None;
                abandoned.push(record.summary.clone());
            }
        }
        abandoned
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create(&self, request: NewApproval) -> ApprovalSummary {
        let summary = ApprovalSummary {
            approval_id: ApprovalId::new(),
            session_id: request.session_id,
            tool_name: request.tool_name,
            proposed_action: request.proposed_action,
            explanation: request.explanation,
            status: ApprovalStatus::Pending,
            created_at: Timestamp::now(),
            resolved_at: None,
        };
        self.records().insert(
            summary.approval_id,
            ApprovalRecord {
                summary: summary.clone(),
                continuation: Some(request.continuation),
            },
        );
        debug!(approval_id = %summary.approval_id, tool = %summary.tool_name, "Approval created");
        summary
    }

    async fn claim(
        &self,
        approval_id: &ApprovalId,
        decision: Decision,
    ) -> Result<ClaimedApproval, ApprovalError> {
        let mut records = self.records();
        let record = records
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;

        if record.summary.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                id: *approval_id,
                status: record.summary.status,
            });
        }
        let continuation = record
            .continuation
            .take()
            .ok_or(ApprovalError::AlreadyResolved {
                id: *approval_id,
                status: record.summary.status,
            })?;

        record.summary.status = decision.status();
        record.summary.resolved_at = Some(Timestamp::now());
        info!(approval_id = %approval_id, decision = %decision, "Approval claimed");

        Ok(ClaimedApproval {
            summary: record.summary.clone(),
            decision,
            continuation,
        })
    }

    async fn get(&self, approval_id: &ApprovalId) -> Option<ApprovalSummary> {
        self.records()
            .get(approval_id)
            .map(|record| record.summary.clone())
    }

    async fn pending(&self) -> Vec<ApprovalSummary> {
        let mut pending: Vec<ApprovalSummary> = self
            .records()
            .values()
            .filter(|record| record.summary.status == ApprovalStatus::Pending)
            .map(|record| record.summary.clone())
            .collect();
        pending.sort_by_key(|summary| summary.created_at);
        pending
    }

    async fn expire(&self, now: Timestamp, ttl_secs: u64) -> Vec<ApprovalSummary> {
        self.abandon_where(now, |summary| {
            summary.created_at.seconds_until(now) >= ttl_secs
        })
    }

    async fn abandon_session(&self, session_id: &SessionId) -> Vec<ApprovalSummary> {
        self.abandon_where(Timestamp::now(), |summary| &summary.session_id == session_id)
    }

    async fn prune(&self, now: Timestamp, retain_secs: u64) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| match record.summary.resolved_at {
            Some(resolved_at) => resolved_at.seconds_until(now) < retain_secs,
            None => true,
        });
        before - records.len()
    }
}
