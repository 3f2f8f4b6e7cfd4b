//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path/body parameters via axum extractors, calls the
//! orchestrator, and returns JSON (or an SSE stream for turns).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use tabula_chat::{
    ApprovalResolution, ApprovalSummary, SessionRecord, SessionSummary, TurnRequest,
};
use tabula_core::audit::AuditRecord;
use tabula_core::types::{Decision, SessionId};

use crate::error::ApiError;
use crate::state::AppState;

/// Default number of audit entries returned by `GET /audit`.
const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 500;

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approval_id: String,
    /// `approve` or `reject`.
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub limit: Option<usize>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub pending_approvals: usize,
}

#[derive(Debug, Serialize)]
pub struct ApprovalsResponse {
    pub approvals: Vec<ApprovalSummary>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub entries: Vec<AuditRecord>,
}

// =============================================================================
// Turns
// =============================================================================

/// POST /chat - run one turn and stream its events.
///
/// Invalid questions are rejected with 400 before the stream opens. Closing
/// the connection stops the turn.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    state.orchestrator.validate(&request.question)?;

    let rx = state.orchestrator.spawn_turn(request);
    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("error")))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

// =============================================================================
// Approvals
// =============================================================================

/// POST /approvals - approve or reject a pending action and return the
/// events of the resumed turn.
pub async fn resolve_approval(
    State(state): State<AppState>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<ApprovalResolution>, ApiError> {
    let decision: Decision = request
        .action
        .trim()
        .to_lowercase()
        .parse()
        .map_err(ApiError::BadRequest)?;

    let resolution = state
        .orchestrator
        .resolve_approval(&request.approval_id, decision)
        .await?;
    Ok(Json(resolution))
}

/// GET /approvals - pending approvals, oldest first.
pub async fn list_approvals(State(state): State<AppState>) -> Json<ApprovalsResponse> {
    Json(ApprovalsResponse {
        approvals: state.orchestrator.pending_approvals().await,
    })
}

/// GET /audit - most recent approved executions.
pub async fn audit_log(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditResponse>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .min(MAX_AUDIT_LIMIT);

    let entries = match &state.audit {
        Some(audit) => audit.recent(limit)?,
        None => Vec::new(),
    };
    Ok(Json(AuditResponse { entries }))
}

// =============================================================================
// Sessions
// =============================================================================

/// GET /sessions - all live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.orchestrator.sessions().await,
    })
}

/// GET /sessions/{id} - one session with its recent turn history.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    state
        .orchestrator
        .session(&SessionId::new(id.clone()))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", id)))
}

/// POST /sessions/{id}/reset - clear the session's memory. Idempotent.
pub async fn reset_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.orchestrator.reset_session(&SessionId::new(id)).await;
    StatusCode::NO_CONTENT
}

/// DELETE /sessions/{id} - remove the session and abandon its approvals.
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.orchestrator.delete_session(&SessionId::new(id)).await;
    StatusCode::NO_CONTENT
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.orchestrator.stats().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_sessions: stats.active_sessions,
        pending_approvals: stats.pending_approvals,
    })
}
