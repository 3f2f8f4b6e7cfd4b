//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping orchestrator errors to appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use tabula_chat::{ApprovalError, ChatError};
use tabula_core::capability::ExecutionError;
use tabula_core::error::TabulaError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    #[error("{0}")]
    BadRequest(String),
    /// 404 Not Found - resource does not exist.
    #[error("{0}")]
    NotFound(String),
    /// 409 Conflict - the approval was already decided.
    #[error("{message}")]
    Conflict {
        message: String,
        details: Option<serde_json::Value>,
    },
    /// 500 Internal Server Error - unexpected server error.
    #[error("{0}")]
    Internal(String),
    /// 503 Service Unavailable - a collaborator is not reachable.
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            ApiError::Conflict { message, details } => {
                (StatusCode::CONFLICT, "conflict", message, details)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg, None)
            }
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg,
                None,
            ),
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            e if e.is_invalid_input() => ApiError::BadRequest(e.to_string()),
            ChatError::Approval(ApprovalError::NotFound(id)) => {
                ApiError::NotFound(format!("approval not found: {}", id))
            }
            ChatError::Approval(ApprovalError::AlreadyResolved { id, status }) => {
                ApiError::Conflict {
                    message: format!("approval {} already resolved ({})", id, status),
                    details: Some(serde_json::json!({
                        "approvalId": id,
                        "status": status,
                    })),
                }
            }
            e @ ChatError::Execution(ExecutionError::Unavailable(_)) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TabulaError> for ApiError {
    fn from(err: TabulaError) -> Self {
        match err {
            TabulaError::Config(msg) => ApiError::BadRequest(msg),
            e => ApiError::Internal(e.to_string()),
        }
    }
}
