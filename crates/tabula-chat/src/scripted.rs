//! Scripted capability doubles.
//!
//! Deterministic stand-ins for a model provider and an execution engine.
//! Each replays queued responses and records every call it receives, which
//! makes orchestration behavior observable in tests and benchmarks.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tabula_core::capability::{
    AdminStep, ExecutionError, Generation, GenerationRequest, ModelError, ModelService,
    QueryExecutor, QueryOutput, ToolCall, TranscriptEntry,
};
use tabula_core::types::{MemoryHandle, Mode, TokenUsage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// ScriptedModel
// =============================================================================

#[derive(Default)]
struct ModelScript {
    modes: VecDeque<Result<Mode, ModelError>>,
    generations: VecDeque<Result<Generation, ModelError>>,
    steps: VecDeque<Result<AdminStep, ModelError>>,
}

#[derive(Default)]
struct ModelCalls {
    classify_memories: Vec<Option<MemoryHandle>>,
    generation_requests: Vec<GenerationRequest>,
    step_transcripts: Vec<Vec<TranscriptEntry>>,
    step_memories: Vec<Option<MemoryHandle>>,
    forgotten: Vec<MemoryHandle>,
}

/// Model double replaying queued classifications, generations and steps.
///
/// When a queue runs dry: classification falls back to the default mode,
/// generation fails with `InvalidResponse`, and the admin loop finishes.
pub struct ScriptedModel {
    default_mode: Mode,
    script: Mutex<ModelScript>,
    calls: Mutex<ModelCalls>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            default_mode: Mode::DataQuery,
            script: Mutex::new(ModelScript::default()),
            calls: Mutex::new(ModelCalls::default()),
        }
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_mode(mut self, mode: Mode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_modes(self, modes: impl IntoIterator<Item = Mode>) -> Self {
        for mode in modes {
            self.push_mode(mode);
        }
        self
    }

    pub fn failing_classification(self, error: ModelError) -> Self {
        lock(&self.script).modes.push_back(Err(error));
        self
    }

    pub fn with_generations(
        self,
        generations: impl IntoIterator<Item = Result<Generation, ModelError>>,
    ) -> Self {
        for generation in generations {
            self.push_generation(generation);
        }
        self
    }

    pub fn with_steps(
        self,
        steps: impl IntoIterator<Item = Result<AdminStep, ModelError>>,
    ) -> Self {
        for step in steps {
            self.push_step(step);
        }
        self
    }

    pub fn push_mode(&self, mode: Mode) {
        lock(&self.script).modes.push_back(Ok(mode));
    }

    pub fn push_generation(&self, generation: Result<Generation, ModelError>) {
        lock(&self.script).generations.push_back(generation);
    }

    pub fn push_step(&self, step: Result<AdminStep, ModelError>) {
        lock(&self.script).steps.push_back(step);
    }

    /// A successful generation binding `memory`.
    pub fn generation(query: &str, memory: Option<&str>) -> Result<Generation, ModelError> {
        Ok(Generation {
            query: query.to_string(),
            answer: None,
            usage: TokenUsage::new(10, 5),
            memory: memory.map(MemoryHandle::new),
        })
    }

    pub fn text(text: &str) -> Result<AdminStep, ModelError> {
        Ok(AdminStep::Text {
            text: text.to_string(),
            usage: TokenUsage::new(4, 2),
        })
    }

    pub fn tool(id: &str, name: &str, statement: &str) -> Result<AdminStep, ModelError> {
        Ok(AdminStep::ToolCall {
            call: ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: json!({ "statement": statement }),
                declared_mutating: false,
                explanation: Some(format!("Runs {}", name)),
            },
            usage: TokenUsage::new(4, 2),
        })
    }

    pub fn finish(memory: Option<&str>) -> Result<AdminStep, ModelError> {
        Ok(AdminStep::Finish {
            usage: TokenUsage::new(1, 1),
            memory: memory.map(MemoryHandle::new),
        })
    }

    pub fn classify_memories(&self) -> Vec<Option<MemoryHandle>> {
        lock(&self.calls).classify_memories.clone()
    }

    pub fn generation_requests(&self) -> Vec<GenerationRequest> {
        lock(&self.calls).generation_requests.clone()
    }

    pub fn step_transcripts(&self) -> Vec<Vec<TranscriptEntry>> {
        lock(&self.calls).step_transcripts.clone()
    }

    pub fn step_memories(&self) -> Vec<Option<MemoryHandle>> {
        lock(&self.calls).step_memories.clone()
    }

    pub fn forgotten(&self) -> Vec<MemoryHandle> {
        lock(&self.calls).forgotten.clone()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(
        &self,
        _question: &str,
        memory: Option<&MemoryHandle>,
        _model: &str,
    ) -> Result<Mode, ModelError> {
        lock(&self.calls).classify_memories.push(memory.cloned());
        lock(&self.script)
            .modes
            .pop_front()
            .unwrap_or(Ok(self.default_mode))
    }

    async fn generate_query(&self, request: &GenerationRequest) -> Result<Generation, ModelError> {
        lock(&self.calls).generation_requests.push(request.clone());
        lock(&self.script)
            .generations
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::InvalidResponse("script exhausted".to_string())))
    }

    async fn next_step(
        &self,
        transcript: &[TranscriptEntry],
        memory: Option<&MemoryHandle>,
        _model: &str,
    ) -> Result<AdminStep, ModelError> {
        {
            let mut calls = lock(&self.calls);
            calls.step_transcripts.push(transcript.to_vec());
            calls.step_memories.push(memory.cloned());
        }
        lock(&self.script).steps.pop_front().unwrap_or(Ok(AdminStep::Finish {
            usage: TokenUsage::default(),
            memory: None,
        }))
    }

    async fn forget(&self, memory: &MemoryHandle) {
        lock(&self.calls).forgotten.push(memory.clone());
    }
}

// =============================================================================
// ScriptedExecutor
// =============================================================================

#[derive(Default)]
struct ExecutorCalls {
    executed: Vec<String>,
    described: Vec<Option<String>>,
}

/// Execution double.
///
/// Statements matching a failure rule fail with that rule's error. Others
/// consume the response queue, then fall back to a one-cell result set.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<Result<QueryOutput, ExecutionError>>>,
    failures: Vec<(String, ExecutionError)>,
    unavailable: bool,
    delay: Option<Duration>,
    calls: Mutex<ExecutorCalls>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that cannot be reached at all.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_responses(
        self,
        responses: impl IntoIterator<Item = Result<QueryOutput, ExecutionError>>,
    ) -> Self {
        lock(&self.responses).extend(responses);
        self
    }

    /// Fail every statement containing `needle`.
    pub fn fail_matching(mut self, needle: &str, error: ExecutionError) -> Self {
        self.failures.push((needle.to_string(), error));
        self
    }

    /// Sleep before completing each execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: Result<QueryOutput, ExecutionError>) {
        lock(&self.responses).push_back(response);
    }

    /// Statements that completed, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.calls).executed.clone()
    }

    pub fn described(&self) -> Vec<Option<String>> {
        lock(&self.calls).described.clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.calls)
            .executed
            .iter()
            .filter(|statement| statement.contains(needle))
            .count()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(&self, statement: &str) -> Result<QueryOutput, ExecutionError> {
        if self.unavailable {
            return Err(ExecutionError::Unavailable("connection refused".to_string()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.calls).executed.push(statement.to_string());

        if let Some((_, error)) = self
            .failures
            .iter()
            .find(|(needle, _)| statement.contains(needle.as_str()))
        {
            return Err(error.clone());
        }
        lock(&self.responses).pop_front().unwrap_or_else(|| {
            Ok(QueryOutput::new(
                vec!["value".to_string()],
                vec![vec![json!(1)]],
            ))
        })
    }

    async fn describe(&self, table: Option<&str>) -> Result<QueryOutput, ExecutionError> {
        if self.unavailable {
            return Err(ExecutionError::Unavailable("connection refused".to_string()));
        }
        lock(&self.calls).described.push(table.map(str::to_string));
        Ok(match table {
            None => QueryOutput::new(
                vec!["name".to_string()],
                vec![vec![json!("orders")], vec![json!("staging_orders")]],
            ),
            Some(_) => QueryOutput::new(
                vec!["name".to_string(), "type".to_string()],
                vec![vec![json!("id"), json!("INTEGER")]],
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_model_replays_and_records() {
        let model = ScriptedModel::new()
            .with_generations([ScriptedModel::generation("SELECT 1", Some("m1"))]);
        let request = GenerationRequest {
            question: "q".into(),
            memory: None,
            model: "test".into(),
            attempt: 0,
            last_query: None,
            last_error: None,
        };
        let first = model.generate_query(&request).await.unwrap();
        assert_eq!(first.memory, Some(MemoryHandle::new("m1")));
        assert!(matches!(
            model.generate_query(&request).await,
            Err(ModelError::InvalidResponse(_))
        ));
        assert_eq!(model.generation_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_executor_failure_rules_and_queue() {
        let executor = ScriptedExecutor::new()
            .fail_matching("bogus", ExecutionError::Rejected("no such column: bogus".into()))
            .with_responses([Ok(QueryOutput::affected(3))]);

        assert!(executor.execute("SELECT bogus FROM t").await.is_err());
        assert_eq!(
            executor.execute("DELETE FROM t").await.unwrap(),
            QueryOutput::affected(3)
        );
        assert_eq!(executor.execute("SELECT 1").await.unwrap().rows.len(), 1);
        assert_eq!(executor.count_matching("bogus"), 1);
        assert_eq!(executor.executed().len(), 3);
    }
}
