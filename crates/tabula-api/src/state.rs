//! Application state shared across all route handlers.
//!
//! AppState holds the orchestrator and the read-side handles the handlers
//! need. It is passed to handlers via axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use tabula_chat::StreamingOrchestrator;
use tabula_core::config::TabulaConfig;
use tabula_storage::SqliteAuditLog;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Turn orchestration, sessions and approvals.
    pub orchestrator: Arc<StreamingOrchestrator>,
    /// Application configuration (read-only after startup).
    pub config: Arc<TabulaConfig>,
    /// Approval audit log, when backed by SQLite.
    pub audit: Option<Arc<SqliteAuditLog>>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<StreamingOrchestrator>, config: TabulaConfig) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            audit: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<SqliteAuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }
}
