//! Retry-bounded query generation.
//!
//! Each attempt generates a candidate and executes it. A rejected statement
//! is fed back into the next generation as context, up to `max_retries`
//! regenerations. Model failures and an unreachable engine are fatal.
//!
//! Data queries are read-only. A candidate that could change the data source
//! is rejected without reaching the executor; mutations go through the admin
//! loop and its approval gate.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tabula_core::capability::{
    ExecutionError, GenerationRequest, ModelService, QueryExecutor, QueryOutput,
};
use tabula_core::types::{MemoryHandle, TokenUsage};

use crate::error::ChatError;
use crate::tools::is_mutating_statement;

/// Rejection fed back to the model for a state-changing candidate.
pub const READ_ONLY_REJECTION: &str = "data queries must be read-only";

/// Result of a generator run.
///
/// `error` is set only when every attempt was rejected, in which case the
/// output is empty and `retries` equals the ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub query: String,
    pub output: QueryOutput,
    pub answer: Option<String>,
    pub retries: u32,
    pub error: Option<String>,
    pub usage: TokenUsage,
    /// Memory handle produced by the latest generation.
    pub memory: Option<MemoryHandle>,
}

pub struct RetryBoundedGenerator {
    model: Arc<dyn ModelService>,
    executor: Arc<dyn QueryExecutor>,
    max_retries: u32,
}

impl RetryBoundedGenerator {
    pub fn new(
        model: Arc<dyn ModelService>,
        executor: Arc<dyn QueryExecutor>,
        max_retries: u32,
    ) -> Self {
        Self {
            model,
            executor,
            max_retries,
        }
    }

    /// Execute a candidate, refusing anything that is not read-only.
    async fn execute(&self, query: &str) -> Result<QueryOutput, ExecutionError> {
        if is_mutating_statement(query) {
            warn!(query = %query, "Refusing state-changing data query");
            return Err(ExecutionError::Rejected(READ_ONLY_REJECTION.to_string()));
        }
        self.executor.execute(query).await
    }

    pub async fn run(
        &self,
        question: &str,
        memory: Option<MemoryHandle>,
        model: &str,
    ) -> Result<GenerationOutcome, ChatError> {
        let mut memory = memory;
        let mut usage = TokenUsage::default();
        let mut last_query: Option<String> = None;
        let mut last_error: Option<String> = None;
        let mut answer: Option<String> = None;

        for attempt in 0..=self.max_retries {
            let request = GenerationRequest {
                question: question.to_string(),
                memory: memory.clone(),
                model: model.to_string(),
                attempt,
                last_query: last_query.clone(),
                last_error: last_error.clone(),
            };
            let generation = self.model.generate_query(&request).await.map_err(|e| {
                warn!(attempt, error = %e, "Query generation failed");
                ChatError::Generation(e)
            })?;

            usage += generation.usage;
            if generation.memory.is_some() {
                memory = generation.memory;
            }
            answer = generation.answer;
            debug!(attempt, query = %generation.query, "Executing candidate query");

            match self.execute(&generation.query).await {
                Ok(output) => {
                    info!(retries = attempt, rows = output.rows.len(), "Query succeeded");
                    return Ok(GenerationOutcome {
                        query: generation.query,
                        output,
                        answer,
                        retries: attempt,
                        error: None,
                        usage,
                        memory,
                    });
                }
                Err(ExecutionError::Unavailable(reason)) => {
                    warn!(attempt, reason = %reason, "Execution engine unavailable");
                    return Err(ChatError::Execution(ExecutionError::Unavailable(reason)));
                }
                Err(ExecutionError::Rejected(reason)) => {
                    debug!(attempt, reason = %reason, "Candidate rejected");
                    last_query = Some(generation.query);
                    last_error = Some(reason);
                }
            }
        }

        warn!(max_retries = self.max_retries, "Retry ceiling reached");
        Ok(GenerationOutcome {
            query: last_query.unwrap_or_default(),
            output: QueryOutput::default(),
            answer,
            retries: self.max_retries,
            error: last_error,
            usage,
            memory,
        })
    }
}
