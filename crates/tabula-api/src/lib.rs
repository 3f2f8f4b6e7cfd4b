//! Tabula API crate - axum HTTP server, route handlers, SSE turn streaming.
//!
//! Exposes the orchestrator over HTTP: the chat turn stream, approval
//! resolution, session inspection and management, the approval audit trail,
//! and a health check.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
