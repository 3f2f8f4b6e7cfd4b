//! Error types for turn orchestration.

use tabula_core::capability::{ExecutionError, ModelError};
use tabula_core::types::{ApprovalId, ApprovalStatus};

/// Errors from resolving an approval.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval not found: {0}")]
    NotFound(String),
    #[error("approval {id} already resolved ({status})")]
    AlreadyResolved { id: ApprovalId, status: ApprovalStatus },
}

/// Errors that end a turn or fail an orchestrator call.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("question cannot be empty")]
    EmptyQuestion,
    #[error("question exceeds maximum length of {0} characters")]
    QuestionTooLong(usize),
    #[error("classification failed: {0}")]
    Classification(ModelError),
    #[error("generation failed: {0}")]
    Generation(ModelError),
    #[error("execution failed: {0}")]
    Execution(ExecutionError),
    #[error("admin turn stopped after {0} model steps")]
    StepLimit(usize),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("stream interrupted by client")]
    StreamInterrupted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, ChatError::EmptyQuestion | ChatError::QuestionTooLong(_))
    }
}
