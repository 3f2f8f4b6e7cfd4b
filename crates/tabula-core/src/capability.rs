//! Contracts for the two external collaborators.
//!
//! The orchestrator never talks to a model provider or a database directly.
//! It goes through [`ModelService`] and [`QueryExecutor`], so a deployment can
//! plug in any provider or engine without touching orchestration logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MemoryHandle, Mode, TokenUsage};

// =============================================================================
// Errors
// =============================================================================

/// Failure of the model-invocation capability itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

/// Failure reported by the execution capability.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The engine rejected the statement. Recoverable: the caller may regenerate.
    #[error("statement rejected: {0}")]
    Rejected(String),
    /// The engine could not be reached at all.
    #[error("execution engine unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExecutionError::Rejected(_))
    }
}

// =============================================================================
// Query execution
// =============================================================================

/// Tabular outcome of one executed statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Set for statements without a result set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// True when rows were cut at the executor's row cap.
    #[serde(default)]
    pub truncated: bool,
}

impl QueryOutput {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            truncated: false,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }

    /// Compact text rendering used as a tool observation in the admin transcript.
    pub fn render(&self, max_rows: usize) -> String {
        if let Some(n) = self.rows_affected {
            return format!("ok, {} row(s) affected", n);
        }
        if self.columns.is_empty() {
            return "ok, no result set".to_string();
        }
        let mut out = self.columns.join(" | ");
        for row in self.rows.iter().take(max_rows) {
            out.push('\n');
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&cells.join(" | "));
        }
        if self.rows.len() > max_rows || self.truncated {
            out.push_str(&format!("\n... ({} rows shown)", self.rows.len().min(max_rows)));
        }
        out
    }
}

/// Execution capability: runs a statement against a data source.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute one statement.
    async fn execute(&self, statement: &str) -> Result<QueryOutput, ExecutionError>;

    /// Describe the schema: every table when `table` is `None`, otherwise the
    /// columns of that table.
    async fn describe(&self, table: Option<&str>) -> Result<QueryOutput, ExecutionError>;
}

// =============================================================================
// Model invocation
// =============================================================================

/// Input for one query-generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub question: String,
    pub memory: Option<MemoryHandle>,
    pub model: String,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// The previous candidate, when regenerating.
    pub last_query: Option<String>,
    /// The execution failure that seeded this regeneration.
    pub last_error: Option<String>,
}

/// A candidate query produced by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub query: String,
    /// Optional natural-language answer accompanying the query.
    pub answer: Option<String>,
    pub usage: TokenUsage,
    /// Memory handle to bind to the session after this call.
    pub memory: Option<MemoryHandle>,
}

/// A tool invocation requested by the model during admin assistance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Tag declared by the model. It can escalate a tool to mutating but
    /// never downgrade a statically mutating tool.
    #[serde(default)]
    pub declared_mutating: bool,
    /// Rationale shown to the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ToolCall {
    /// The statement argument, if the tool carries one.
    pub fn statement(&self) -> Option<&str> {
        self.arguments
            .get("statement")
            .or_else(|| self.arguments.get("sql"))
            .and_then(|v| v.as_str())
    }
}

/// One entry of the running admin transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptEntry {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        call: ToolCall,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
}

/// The model's next move in the admin loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminStep {
    /// A fragment of explanation text.
    Text { text: String, usage: TokenUsage },
    /// A tool the model wants to run.
    ToolCall { call: ToolCall, usage: TokenUsage },
    /// The model is done with this turn.
    Finish {
        usage: TokenUsage,
        memory: Option<MemoryHandle>,
    },
}

/// Model-invocation capability.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Classify a question into exactly one mode.
    async fn classify(
        &self,
        question: &str,
        memory: Option<&MemoryHandle>,
        model: &str,
    ) -> Result<Mode, ModelError>;

    /// Produce one candidate query.
    async fn generate_query(&self, request: &GenerationRequest) -> Result<Generation, ModelError>;

    /// Produce the next admin step given the running transcript.
    async fn next_step(
        &self,
        transcript: &[TranscriptEntry],
        memory: Option<&MemoryHandle>,
        model: &str,
    ) -> Result<AdminStep, ModelError>;

    /// Release context held behind a handle after a session reset or delete.
    async fn forget(&self, _memory: &MemoryHandle) {}
}
