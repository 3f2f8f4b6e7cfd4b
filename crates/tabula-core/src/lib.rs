//! Tabula core crate - configuration, errors, shared domain types, and the
//! capability traits for the two external collaborators (model invocation
//! and query execution).

pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod types;

pub use audit::{AuditOutcome, AuditRecord, AuditSink, NoopAudit};
pub use capability::{
    AdminStep, ExecutionError, Generation, GenerationRequest, ModelError, ModelService,
    QueryExecutor, QueryOutput, ToolCall, TranscriptEntry,
};
pub use config::TabulaConfig;
pub use error::{Result, TabulaError};
pub use types::*;
