//! Streaming orchestrator: drives one turn from question to terminal event.
//!
//! Per turn: validate, resolve the session, take the session's turn lock,
//! classify, emit `start`, then dispatch. Data queries run the retry-bounded
//! generator and emit a single `full_response`. Admin questions run the tool
//! loop, streaming `delta` and `tool_*` events, and end either with `done` or
//! with an `approval` that suspends the turn. Turns of one session are
//! serialized by the lock; different sessions never share it.
//!
//! Session state is persisted before the terminal event goes out, so a
//! client that sends its next question as soon as it sees `done` always
//! observes the updated memory handle. A resumed approval only writes its
//! handle back if the session still holds the one it was suspended with.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tabula_core::audit::{AuditSink, NoopAudit};
use tabula_core::capability::{ModelService, QueryExecutor, TranscriptEntry};
use tabula_core::config::TabulaConfig;
use tabula_core::types::{
    ApprovalId, ApprovalStatus, Decision, MemoryHandle, Mode, SessionId, Timestamp, TokenUsage,
};

use crate::admin::{AdminOutcome, AdminToolLoop};
use crate::approval::{ApprovalStore, ApprovalSummary, ClaimedApproval, InMemoryApprovalStore};
use crate::error::{ApprovalError, ChatError};
use crate::events::{FullResponse, TurnEmitter, TurnEvent};
use crate::generator::RetryBoundedGenerator;
use crate::router::IntentRouter;
use crate::session::{
    ConversationStore, InMemoryConversationStore, SessionRecord, SessionSummary, TurnOutcome,
    TurnRecord,
};

/// Events buffered per turn before the producer waits on the client.
const EVENT_BUFFER: usize = 64;

/// Request to start a turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub model: Option<String>,
}

impl TurnRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
            model: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Result of resolving an approval.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolution {
    pub approval_id: ApprovalId,
    pub session_id: SessionId,
    pub status: ApprovalStatus,
    /// Events produced by the resumed continuation, ending in a terminal event.
    pub events: Vec<TurnEvent>,
    pub answer: Option<String>,
    pub error: Option<String>,
    /// Set when the resumed loop proposed another mutating action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_approval: Option<ApprovalSummary>,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evicted_sessions: usize,
    pub abandoned_approvals: usize,
    pub pruned_approvals: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub active_sessions: usize,
    pub pending_approvals: usize,
}

/// Orchestration limits and policies.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_retries: u32,
    pub max_admin_steps: usize,
    pub max_question_chars: usize,
    pub default_model: String,
    pub history_limit: usize,
    pub idle_timeout_secs: u64,
    pub approval_ttl_secs: u64,
    pub retain_resolved_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&TabulaConfig::default())
    }
}

impl Settings {
    pub fn from_config(config: &TabulaConfig) -> Self {
        Self {
            max_retries: config.orchestrator.max_retries,
            max_admin_steps: config.orchestrator.max_admin_steps,
            max_question_chars: config.orchestrator.max_question_chars,
            default_model: config.orchestrator.default_model.clone(),
            history_limit: config.sessions.history_limit,
            idle_timeout_secs: u64::from(config.sessions.idle_timeout_minutes) * 60,
            approval_ttl_secs: config.approvals.ttl_secs,
            retain_resolved_secs: config.approvals.retain_resolved_secs,
        }
    }
}

pub struct StreamingOrchestrator {
    model: Arc<dyn ModelService>,
    executor: Arc<dyn QueryExecutor>,
    audit: Arc<dyn AuditSink>,
    router: IntentRouter,
    generator: RetryBoundedGenerator,
    admin: AdminToolLoop,
    conversations: Arc<dyn ConversationStore>,
    approvals: Arc<dyn ApprovalStore>,
    turn_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    settings: Settings,
}

impl StreamingOrchestrator {
    /// Orchestrator over in-memory stores with no audit sink.
    pub fn new(
        model: Arc<dyn ModelService>,
        executor: Arc<dyn QueryExecutor>,
        settings: Settings,
    ) -> Self {
        let conversations: Arc<dyn ConversationStore> =
            Arc::new(InMemoryConversationStore::new(settings.history_limit));
        let approvals: Arc<dyn ApprovalStore> = Arc::new(InMemoryApprovalStore::new());
        let audit: Arc<dyn AuditSink> = Arc::new(NoopAudit);

        Self {
            router: IntentRouter::new(model.clone()),
            generator: RetryBoundedGenerator::new(
                model.clone(),
                executor.clone(),
                settings.max_retries,
            ),
            admin: AdminToolLoop::new(
                model.clone(),
                executor.clone(),
                approvals.clone(),
                audit.clone(),
                settings.max_admin_steps,
            ),
            model,
            executor,
            audit,
            conversations,
            approvals,
            turn_locks: DashMap::new(),
            settings,
        }
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = store;
        self
    }

    pub fn with_approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.approvals = store;
        self.rebuild_admin();
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self.rebuild_admin();
        self
    }

    fn rebuild_admin(&mut self) {
        self.admin = AdminToolLoop::new(
            self.model.clone(),
            self.executor.clone(),
            self.approvals.clone(),
            self.audit.clone(),
            self.settings.max_admin_steps,
        );
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reject questions that are empty or over the length limit.
    pub fn validate(&self, question: &str) -> Result<(), ChatError> {
        if question.trim().is_empty() {
            return Err(ChatError::EmptyQuestion);
        }
        if question.chars().count() > self.settings.max_question_chars {
            return Err(ChatError::QuestionTooLong(self.settings.max_question_chars));
        }
        Ok(())
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .turn_locks
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // -----------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------

    /// Start a turn on a background task and return its event stream.
    pub fn spawn_turn(self: &Arc<Self>, request: TurnRequest) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_turn(request, tx).await });
        rx
    }

    /// Run a turn to completion, or until the receiver is dropped.
    pub async fn run_turn(&self, request: TurnRequest, tx: mpsc::Sender<TurnEvent>) {
        let watcher = tx.clone();
        let mut emitter = TurnEmitter::new(tx);
        tokio::select! {
            biased;
            _ = watcher.closed() => {
                info!(error = %ChatError::StreamInterrupted, "Turn abandoned");
            }
            _ = self.drive_turn(request, &mut emitter) => {}
        }
    }

    async fn drive_turn(&self, request: TurnRequest, emitter: &mut TurnEmitter) {
        let started = Instant::now();
        if let Err(e) = self.validate(&request.question) {
            emitter.emit(TurnEvent::error(e.to_string())).await;
            return;
        }

        let question = request.question;
        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let session_id = request
            .session_id
            .filter(|id| !id.as_str().trim().is_empty())
            .unwrap_or_else(SessionId::mint);

        let lock = self.session_lock(&session_id);
        let _turn = lock.lock().await;

        let memory = self.conversations.open(&session_id).await;
        let mode = match self
            .router
            .classify(&question, memory.as_ref(), &model)
            .await
        {
            Ok(mode) => mode,
            Err(e) => {
                self.record(
                    &session_id,
                    &question,
                    None,
                    TurnOutcome::Failed,
                    e.to_string(),
                    0,
                    started,
                    TokenUsage::default(),
                )
                .await;
                emitter.emit(TurnEvent::error(e.to_string())).await;
                return;
            }
        };

        info!(session_id = %session_id, mode = %mode, model = %model, "Turn started");
        emitter
            .emit(TurnEvent::Start {
                session_id: session_id.clone(),
                mode,
                model: model.clone(),
            })
            .await;

        match mode {
            Mode::DataQuery => {
                self.data_turn(&session_id, &question, memory, &model, started, emitter)
                    .await
            }
            Mode::AdminAssist => {
                self.admin_turn(&session_id, &question, memory, &model, started, emitter)
                    .await
            }
        }
    }

    async fn data_turn(
        &self,
        session_id: &SessionId,
        question: &str,
        memory: Option<MemoryHandle>,
        model: &str,
        started: Instant,
        emitter: &mut TurnEmitter,
    ) {
        let outcome = match self.generator.run(question, memory, model).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record(
                    session_id,
                    question,
                    Some(Mode::DataQuery),
                    TurnOutcome::Failed,
                    e.to_string(),
                    0,
                    started,
                    TokenUsage::default(),
                )
                .await;
                emitter.emit(TurnEvent::error(e.to_string())).await;
                return;
            }
        };

        if let Some(memory) = &outcome.memory {
            self.conversations.set(session_id, memory.clone()).await;
        }
        let (turn_outcome, summary) = match &outcome.error {
            Some(error) => (TurnOutcome::Failed, error.clone()),
            None => (TurnOutcome::Completed, outcome.query.clone()),
        };
        self.record(
            session_id,
            question,
            Some(Mode::DataQuery),
            turn_outcome,
            summary,
            outcome.retries,
            started,
            outcome.usage,
        )
        .await;

        let elapsed_time = started.elapsed().as_secs_f64();
        let usage = outcome.usage;
        emitter
            .emit(TurnEvent::FullResponse(FullResponse {
                session_id: session_id.clone(),
                mode: Mode::DataQuery,
                model: model.to_string(),
                query: outcome.query,
                columns: outcome.output.columns,
                rows: outcome.output.rows,
                answer: outcome.answer,
                error: outcome.error,
                retries: outcome.retries,
                truncated: outcome.output.truncated,
                elapsed_time,
                tokens_in: usage.input,
                tokens_out: usage.output,
                tokens_total: usage.total(),
            }))
            .await;
        emitter.emit(TurnEvent::done(elapsed_time, usage)).await;
    }

    async fn admin_turn(
        &self,
        session_id: &SessionId,
        question: &str,
        memory: Option<MemoryHandle>,
        model: &str,
        started: Instant,
        emitter: &mut TurnEmitter,
    ) {
        let result = self
            .admin
            .run(session_id, question, memory, model, emitter)
            .await;
        if let Some(event) = self
            .settle_admin(session_id, question, &result, started, true)
            .await
        {
            emitter.emit(event).await;
        }
    }

    /// Persist the outcome of an admin stretch and return the terminal event
    /// still owed to the client, if any. A handle from the stretch is bound
    /// only when `bind_memory` is set.
    async fn settle_admin(
        &self,
        session_id: &SessionId,
        question: &str,
        result: &Result<AdminOutcome, ChatError>,
        started: Instant,
        bind_memory: bool,
    ) -> Option<TurnEvent> {
        match result {
            Ok(outcome) => {
                if let Some(memory) = outcome.memory().filter(|_| bind_memory) {
                    self.conversations.set(session_id, memory.clone()).await;
                }
                let (turn_outcome, summary) = match outcome {
                    AdminOutcome::Finished { answer, .. } => {
                        (TurnOutcome::Completed, excerpt(answer))
                    }
                    AdminOutcome::Suspended { approval, .. } => {
                        (TurnOutcome::AwaitingApproval, approval.proposed_action.clone())
                    }
                };
                self.record(
                    session_id,
                    question,
                    Some(Mode::AdminAssist),
                    turn_outcome,
                    summary,
                    0,
                    started,
                    outcome.usage(),
                )
                .await;
                match outcome {
                    AdminOutcome::Finished { usage, .. } => {
                        Some(TurnEvent::done(started.elapsed().as_secs_f64(), *usage))
                    }
                    // The approval event already closed the stream.
                    AdminOutcome::Suspended { .. } => None,
                }
            }
            Err(ChatError::StreamInterrupted) => {
                info!(
                    session_id = %session_id,
                    error = %ChatError::StreamInterrupted,
                    "Turn abandoned"
                );
                None
            }
            Err(e) => {
                self.record(
                    session_id,
                    question,
                    Some(Mode::AdminAssist),
                    TurnOutcome::Failed,
                    e.to_string(),
                    0,
                    started,
                    TokenUsage::default(),
                )
                .await;
                Some(TurnEvent::error(e.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        session_id: &SessionId,
        question: &str,
        mode: Option<Mode>,
        outcome: TurnOutcome,
        summary: String,
        retries: u32,
        started: Instant,
        tokens: TokenUsage,
    ) {
        self.conversations
            .record_turn(
                session_id,
                TurnRecord {
                    question: question.to_string(),
                    mode,
                    outcome,
                    summary,
                    retries,
                    elapsed_time: started.elapsed().as_secs_f64(),
                    tokens,
                    at: Timestamp::now(),
                },
            )
            .await;
    }

    // -----------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------

    /// Resolve a pending approval and run its continuation.
    ///
    /// The continuation runs on its own task, so an approved action finishes
    /// even if the caller stops waiting for the result.
    pub async fn resolve_approval(
        self: &Arc<Self>,
        approval_id: &str,
        decision: Decision,
    ) -> Result<ApprovalResolution, ChatError> {
        let id: ApprovalId = approval_id
            .trim()
            .parse()
            .map_err(|_| ApprovalError::NotFound(approval_id.to_string()))?;
        let claimed = self.approvals.claim(&id, decision).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.resume(claimed).await })
            .await
            .map_err(|e| ChatError::Internal(format!("approval worker failed: {}", e)))
    }

    async fn resume(&self, claimed: ClaimedApproval) -> ApprovalResolution {
        let started = Instant::now();
        let ClaimedApproval {
            summary,
            decision,
            mut continuation,
        } = claimed;
        let session_id = continuation.session_id.clone();
        let question = original_question(&continuation.transcript);

        let lock = self.session_lock(&session_id);
        let _turn = lock.lock().await;

        // A reset or a newer turn may have replaced the handle while the
        // approval was pending. The resumed stretch then runs on the current
        // handle and leaves the session's binding alone.
        let current = self.conversations.get(&session_id).await;
        let unchanged = current == continuation.memory;
        if !unchanged {
            debug!(
                approval_id = %summary.approval_id,
                session_id = %session_id,
                "Session memory changed while awaiting approval"
            );
            continuation.memory = current;
        }

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut emitter = TurnEmitter::new(tx);
        let work = async {
            let result = match decision {
                Decision::Approve => {
                    self.admin
                        .proceed(summary.approval_id, continuation, &mut emitter)
                        .await
                }
                Decision::Reject => {
                    self.admin
                        .abort(continuation, summary.status, &mut emitter)
                        .await
                }
            };
            if let Some(event) = self
                .settle_admin(&session_id, &question, &result, started, unchanged)
                .await
            {
                emitter.emit(event).await;
            }
            drop(emitter);
            result
        };
        let collect = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let (result, events) = tokio::join!(work, collect);

        let (answer, error, next_approval) = match result {
            Ok(AdminOutcome::Finished { answer, .. }) => (Some(answer), None, None),
            Ok(AdminOutcome::Suspended {
                approval, answer, ..
            }) => (Some(answer), None, Some(approval)),
            Err(e) => (None, Some(e.to_string()), None),
        };
        info!(
            approval_id = %summary.approval_id,
            status = %summary.status,
            failed = error.is_some(),
            "Approval resolved"
        );

        ApprovalResolution {
            approval_id: summary.approval_id,
            session_id,
            status: summary.status,
            events,
            answer: answer.filter(|a| !a.is_empty()),
            error,
            next_approval,
        }
    }

    pub async fn approval(&self, approval_id: &ApprovalId) -> Option<ApprovalSummary> {
        self.approvals.get(approval_id).await
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalSummary> {
        self.approvals.pending().await
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.conversations.list().await
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.conversations.session(session_id).await
    }

    /// Clear a session's memory handle. Unknown sessions are a no-op.
    pub async fn reset_session(&self, session_id: &SessionId) {
        let cleared = {
            let lock = self.session_lock(session_id);
            let _turn = lock.lock().await;
            self.conversations.reset(session_id).await
        };
        if let Some(memory) = cleared {
            self.model.forget(&memory).await;
        }
        debug!(session_id = %session_id, "Session reset");
    }

    /// Remove a session and abandon its pending approvals. Unknown sessions
    /// are a no-op. Returns whether the session existed.
    ///
    /// Waits for an in-flight turn of the session, so an approval that turn
    /// creates is abandoned too.
    pub async fn delete_session(&self, session_id: &SessionId) -> bool {
        let (record, abandoned) = {
            let lock = self.session_lock(session_id);
            let _turn = lock.lock().await;
            let record = self.conversations.delete(session_id).await;
            let abandoned = self.approvals.abandon_session(session_id).await;
            (record, abandoned)
        };
        self.turn_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);

        if let Some(memory) = record.as_ref().and_then(|r| r.memory.as_ref()) {
            self.model.forget(memory).await;
        }
        if record.is_some() || !abandoned.is_empty() {
            info!(
                session_id = %session_id,
                abandoned_approvals = abandoned.len(),
                "Session deleted"
            );
        }
        record.is_some()
    }

    // -----------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------

    /// Evict idle sessions, expire stale approvals, and prune old tombstones.
    pub async fn sweep(&self) -> SweepReport {
        let now = Timestamp::now();
        let mut report = SweepReport::default();

        let evicted = self
            .conversations
            .evict_idle(now, self.settings.idle_timeout_secs)
            .await;
        report.evicted_sessions = evicted.len();
        for record in &evicted {
            report.abandoned_approvals += self
                .approvals
                .abandon_session(&record.session_id)
                .await
                .len();
            if let Some(memory) = &record.memory {
                self.model.forget(memory).await;
            }
        }

        let expired = self
            .approvals
            .expire(now, self.settings.approval_ttl_secs)
            .await;
        for approval in &expired {
            warn!(
                approval_id = %approval.approval_id,
                session_id = %approval.session_id,
                "Approval expired unresolved"
            );
        }
        report.abandoned_approvals += expired.len();
        report.pruned_approvals = self
            .approvals
            .prune(now, self.settings.retain_resolved_secs)
            .await;

        self.turn_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if report != SweepReport::default() {
            debug!(?report, "Sweep complete");
        }
        report
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_sessions: self.conversations.len().await,
            pending_approvals: self.approvals.pending().await.len(),
        }
    }

    pub async fn close(&self) {
        self.conversations.close().await;
        self.approvals.close().await;
    }
}

fn original_question(transcript: &[TranscriptEntry]) -> String {
    transcript
        .iter()
        .find_map(|entry| match entry {
            TranscriptEntry::User { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn excerpt(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let mut out: String = text.chars().take(LIMIT).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedExecutor, ScriptedModel};
    use crate::tools::{DROP_TABLE, RUN_SELECT};
    use std::time::Duration;
    use tabula_core::capability::{ExecutionError, ModelError};

    fn orchestrator(
        model: ScriptedModel,
        executor: ScriptedExecutor,
    ) -> (Arc<StreamingOrchestrator>, Arc<ScriptedModel>, Arc<ScriptedExecutor>) {
        orchestrator_with(model, executor, Settings::default())
    }

    fn orchestrator_with(
        model: ScriptedModel,
        executor: ScriptedExecutor,
        settings: Settings,
    ) -> (Arc<StreamingOrchestrator>, Arc<ScriptedModel>, Arc<ScriptedExecutor>) {
        let model = Arc::new(model);
        let executor = Arc::new(executor);
        let orch = Arc::new(StreamingOrchestrator::new(
            model.clone(),
            executor.clone(),
            settings,
        ));
        (orch, model, executor)
    }

    async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn turn(orch: &Arc<StreamingOrchestrator>, request: TurnRequest) -> Vec<TurnEvent> {
        collect(orch.spawn_turn(request)).await
    }

    fn kinds(events: &[TurnEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    fn full_response(events: &[TurnEvent]) -> &FullResponse {
        events
            .iter()
            .find_map(|e| match e {
                TurnEvent::FullResponse(full) => Some(full),
                _ => None,
            })
            .expect("full_response event")
    }

    fn approval_id(events: &[TurnEvent]) -> ApprovalId {
        events
            .iter()
            .find_map(|e| match e {
                TurnEvent::Approval { approval_id, .. } => Some(*approval_id),
                _ => None,
            })
            .expect("approval event")
    }

    fn drop_model() -> ScriptedModel {
        ScriptedModel::new().with_modes([Mode::AdminAssist]).with_steps([
            ScriptedModel::text("The staging table can be dropped."),
            ScriptedModel::tool("c1", DROP_TABLE, "DROP TABLE staging_orders"),
            ScriptedModel::text("Dropped."),
            ScriptedModel::finish(Some("m-admin")),
        ])
    }

    #[tokio::test]
    async fn test_data_turn_mints_session() {
        let (orch, _, _) = orchestrator(
            ScriptedModel::new().with_generations([ScriptedModel::generation(
                "SELECT * FROM orders ORDER BY amount DESC LIMIT 5",
                Some("m1"),
            )]),
            ScriptedExecutor::new(),
        );
        let events = turn(&orch, TurnRequest::new("List the five largest orders")).await;

        assert_eq!(kinds(&events), vec!["start", "full_response", "done"]);
        let TurnEvent::Start {
            session_id, mode, ..
        } = &events[0]
        else {
            panic!("expected start");
        };
        assert!(!session_id.as_str().is_empty());
        assert_eq!(*mode, Mode::DataQuery);

        let full = full_response(&events);
        assert_eq!(full.retries, 0);
        assert!(full.error.is_none());
        assert_eq!(&full.session_id, session_id);
        assert_eq!(full.model, "rules");
        assert_eq!(full.tokens_total, 15);

        let record = orch.session(session_id).await.unwrap();
        assert_eq!(record.memory, Some(MemoryHandle::new("m1")));
        assert_eq!(record.turn_count, 1);
    }

    #[tokio::test]
    async fn test_single_regeneration_reports_one_retry() {
        let (orch, _, _) = orchestrator(
            ScriptedModel::new().with_generations([
                ScriptedModel::generation("SELECT * FROM orders ORDER BY total DESC", None),
                ScriptedModel::generation("SELECT * FROM orders ORDER BY amount DESC", None),
            ]),
            ScriptedExecutor::new().fail_matching(
                "total",
                ExecutionError::Rejected("no such column: total".into()),
            ),
        );
        let events = turn(&orch, TurnRequest::new("List the five largest orders")).await;
        let full = full_response(&events);
        assert_eq!(full.retries, 1);
        assert!(full.error.is_none());
        assert_eq!(full.query, "SELECT * FROM orders ORDER BY amount DESC");
    }

    #[tokio::test]
    async fn test_retry_ceiling_reports_error() {
        let (orch, model, executor) = orchestrator(
            ScriptedModel::new().with_generations(
                (0..3).map(|_| ScriptedModel::generation("SELECT nope FROM orders", None)),
            ),
            ScriptedExecutor::new().fail_matching(
                "nope",
                ExecutionError::Rejected("no such column: nope".into()),
            ),
        );
        let events = turn(&orch, TurnRequest::new("q")).await;

        assert_eq!(kinds(&events), vec!["start", "full_response", "done"]);
        let full = full_response(&events);
        assert_eq!(full.retries, 2);
        assert_eq!(full.error.as_deref(), Some("no such column: nope"));
        assert!(full.rows.is_empty());
        assert_eq!(model.generation_requests().len(), 3);
        assert_eq!(executor.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_generation_failure_emits_error() {
        let (orch, _, _) = orchestrator(
            ScriptedModel::new().with_generations([Err(ModelError::Unavailable("503".into()))]),
            ScriptedExecutor::new(),
        );
        let events = turn(&orch, TurnRequest::new("q")).await;
        assert_eq!(kinds(&events), vec!["start", "error"]);
    }

    #[tokio::test]
    async fn test_classification_failure_has_no_start() {
        let (orch, model, executor) = orchestrator(
            ScriptedModel::new().failing_classification(ModelError::Timeout(5)),
            ScriptedExecutor::new(),
        );
        let events = turn(&orch, TurnRequest::new("q")).await;
        assert_eq!(kinds(&events), vec!["error"]);
        assert!(model.generation_requests().is_empty());
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_questions() {
        let settings = Settings {
            max_question_chars: 10,
            ..Settings::default()
        };
        let (orch, model, _) =
            orchestrator_with(ScriptedModel::new(), ScriptedExecutor::new(), settings);

        for question in ["", "   ", "this question is too long"] {
            let events = turn(&orch, TurnRequest::new(question)).await;
            assert_eq!(kinds(&events), vec!["error"], "{:?}", question);
        }
        assert!(model.classify_memories().is_empty());
        assert_eq!(orch.stats().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_session_continuity() {
        let (orch, model, _) = orchestrator(
            ScriptedModel::new().with_generations([
                ScriptedModel::generation("SELECT 1", Some("m1")),
                ScriptedModel::generation("SELECT 2", Some("m2")),
            ]),
            ScriptedExecutor::new(),
        );
        turn(&orch, TurnRequest::new("first").in_session("s1")).await;
        turn(&orch, TurnRequest::new("second").in_session("s1")).await;

        assert_eq!(
            model.classify_memories(),
            vec![None, Some(MemoryHandle::new("m1"))]
        );
        let requests = model.generation_requests();
        assert_eq!(requests[1].memory, Some(MemoryHandle::new("m1")));
        assert_eq!(
            orch.session(&SessionId::from("s1")).await.unwrap().memory,
            Some(MemoryHandle::new("m2"))
        );
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (orch, model, _) = orchestrator(
            ScriptedModel::new().with_generations([
                ScriptedModel::generation("SELECT 1", Some("m1")),
                ScriptedModel::generation("SELECT 2", Some("m2")),
            ]),
            ScriptedExecutor::new(),
        );
        let session = SessionId::from("s1");
        turn(&orch, TurnRequest::new("first").in_session("s1")).await;

        orch.reset_session(&session).await;
        orch.reset_session(&session).await;
        assert_eq!(model.forgotten(), vec![MemoryHandle::new("m1")]);

        turn(&orch, TurnRequest::new("second").in_session("s1")).await;
        assert_eq!(model.classify_memories(), vec![None, None]);
        assert_eq!(model.generation_requests()[1].memory, None);

        // The session record itself survives a reset.
        assert_eq!(orch.session(&session).await.unwrap().turn_count, 2);
    }

    /// Data turn binding `m1`, then an admin turn that suspends on a drop.
    fn data_then_drop_model() -> ScriptedModel {
        ScriptedModel::new()
            .with_modes([Mode::DataQuery, Mode::AdminAssist, Mode::DataQuery])
            .with_generations([
                ScriptedModel::generation("SELECT 1", Some("m1")),
                ScriptedModel::generation("SELECT 2", Some("m2")),
            ])
            .with_steps([
                ScriptedModel::text("The staging table can be dropped."),
                ScriptedModel::tool("c1", DROP_TABLE, "DROP TABLE staging_orders"),
                ScriptedModel::text("Dropped."),
                ScriptedModel::finish(Some("m-admin")),
            ])
    }

    #[tokio::test]
    async fn test_reset_while_awaiting_approval_stays_cleared() {
        let (orch, model, executor) = orchestrator(data_then_drop_model(), ScriptedExecutor::new());
        let session = SessionId::from("s1");
        turn(&orch, TurnRequest::new("first").in_session("s1")).await;
        let events = turn(&orch, TurnRequest::new("Drop the staging table").in_session("s1")).await;
        let id = approval_id(&events).to_string();

        orch.reset_session(&session).await;
        assert_eq!(orch.session(&session).await.unwrap().memory, None);

        let resolution = orch.resolve_approval(&id, Decision::Approve).await.unwrap();
        assert_eq!(resolution.status, ApprovalStatus::Approved);
        assert_eq!(executor.count_matching("DROP TABLE staging_orders"), 1);

        assert_eq!(orch.session(&session).await.unwrap().memory, None);
        assert_eq!(model.forgotten(), vec![MemoryHandle::new("m1")]);
        // The resumed steps never saw the forgotten handle.
        assert_eq!(model.step_memories()[2..].to_vec(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_newer_binding_survives_resumed_approval() {
        let (orch, model, _) = orchestrator(data_then_drop_model(), ScriptedExecutor::new());
        let session = SessionId::from("s1");
        turn(&orch, TurnRequest::new("first").in_session("s1")).await;
        let events = turn(&orch, TurnRequest::new("Drop the staging table").in_session("s1")).await;
        let id = approval_id(&events).to_string();
        turn(&orch, TurnRequest::new("third").in_session("s1")).await;
        assert_eq!(
            orch.session(&session).await.unwrap().memory,
            Some(MemoryHandle::new("m2"))
        );

        orch.resolve_approval(&id, Decision::Approve).await.unwrap();

        assert_eq!(
            orch.session(&session).await.unwrap().memory,
            Some(MemoryHandle::new("m2"))
        );
        let memories = model.step_memories();
        assert_eq!(memories[0], Some(MemoryHandle::new("m1")));
        assert_eq!(memories.last(), Some(&Some(MemoryHandle::new("m2"))));
    }

    #[tokio::test]
    async fn test_state_changing_data_query_is_never_executed() {
        let (orch, _, executor) = orchestrator(
            ScriptedModel::new().with_generations(
                (0..3).map(|_| ScriptedModel::generation("DELETE FROM orders", None)),
            ),
            ScriptedExecutor::new(),
        );
        let events = turn(&orch, TurnRequest::new("Tidy the orders")).await;

        assert_eq!(kinds(&events), vec!["start", "full_response", "done"]);
        let full = full_response(&events);
        assert_eq!(
            full.error.as_deref(),
            Some(crate::generator::READ_ONLY_REJECTION)
        );
        assert!(full.rows.is_empty());
        assert!(executor.executed().is_empty());
        assert_eq!(orch.stats().await.pending_approvals, 0);
    }

    #[tokio::test]
    async fn test_reset_and_delete_unknown_session_are_noops() {
        let (orch, model, _) = orchestrator(ScriptedModel::new(), ScriptedExecutor::new());
        let ghost = SessionId::from("ghost");
        orch.reset_session(&ghost).await;
        assert!(!orch.delete_session(&ghost).await);
        assert!(!orch.delete_session(&ghost).await);
        assert!(model.forgotten().is_empty());
    }

    #[tokio::test]
    async fn test_admin_turn_suspends_for_approval() {
        let (orch, _, executor) = orchestrator(drop_model(), ScriptedExecutor::new());
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;

        assert_eq!(kinds(&events), vec!["start", "delta", "approval"]);
        let TurnEvent::Approval {
            tool_name,
            proposed_action,
            ..
        } = &events[2]
        else {
            panic!("expected approval");
        };
        assert_eq!(tool_name, DROP_TABLE);
        assert!(proposed_action.contains("DROP TABLE staging_orders"));
        assert!(executor.executed().is_empty());
        assert_eq!(orch.stats().await.pending_approvals, 1);
    }

    #[tokio::test]
    async fn test_approve_executes_exactly_once() {
        let (orch, _, executor) = orchestrator(drop_model(), ScriptedExecutor::new());
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;
        let id = approval_id(&events).to_string();

        let resolution = orch.resolve_approval(&id, Decision::Approve).await.unwrap();
        assert_eq!(resolution.status, ApprovalStatus::Approved);
        assert_eq!(resolution.answer.as_deref(), Some("Dropped."));
        assert!(resolution.error.is_none());
        assert_eq!(
            kinds(&resolution.events),
            vec!["tool_start", "tool_done", "delta", "done"]
        );
        assert_eq!(executor.count_matching("DROP TABLE staging_orders"), 1);

        for decision in [Decision::Approve, Decision::Reject] {
            let err = orch.resolve_approval(&id, decision).await.unwrap_err();
            assert!(matches!(
                err,
                ChatError::Approval(ApprovalError::AlreadyResolved {
                    status: ApprovalStatus::Approved,
                    ..
                })
            ));
        }
        assert_eq!(executor.count_matching("DROP TABLE staging_orders"), 1);

        // Resumed work updates the session like any other turn.
        let record = orch.session(&resolution.session_id).await.unwrap();
        assert_eq!(record.memory, Some(MemoryHandle::new("m-admin")));
    }

    #[tokio::test]
    async fn test_reject_then_approve_never_executes() {
        let (orch, model, executor) = orchestrator(drop_model(), ScriptedExecutor::new());
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;
        let id = approval_id(&events).to_string();

        let resolution = orch.resolve_approval(&id, Decision::Reject).await.unwrap();
        assert_eq!(resolution.status, ApprovalStatus::Rejected);
        assert_eq!(kinds(&resolution.events).last(), Some(&"done"));
        assert!(matches!(
            orch.resolve_approval(&id, Decision::Approve).await,
            Err(ChatError::Approval(ApprovalError::AlreadyResolved { .. }))
        ));
        assert!(executor.executed().is_empty());

        // The model saw the cancellation notice.
        let transcripts = model.step_transcripts();
        assert!(transcripts.iter().any(|t| matches!(
            t.last(),
            Some(TranscriptEntry::ToolResult { is_error: true, output, .. })
                if output.contains("rejected")
        )));
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_execute_once() {
        let (orch, _, executor) = orchestrator(drop_model(), ScriptedExecutor::new());
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;
        let id = approval_id(&events).to_string();

        let mut handles = Vec::new();
        for i in 0..8 {
            let orch = Arc::clone(&orch);
            let id = id.clone();
            let decision = if i % 2 == 0 {
                Decision::Approve
            } else {
                Decision::Reject
            };
            handles.push(tokio::spawn(async move {
                orch.resolve_approval(&id, decision).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert!(executor.count_matching("DROP TABLE") <= 1);
    }

    #[tokio::test]
    async fn test_unknown_approval_ids() {
        let (orch, _, _) = orchestrator(ScriptedModel::new(), ScriptedExecutor::new());
        for id in ["not-a-uuid".to_string(), ApprovalId::new().to_string()] {
            let err = orch.resolve_approval(&id, Decision::Approve).await.unwrap_err();
            assert!(matches!(err, ChatError::Approval(ApprovalError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_admin_events_never_follow_terminal() {
        let (orch, _, _) = orchestrator(
            ScriptedModel::new().with_modes([Mode::AdminAssist]).with_steps([
                ScriptedModel::text("Checking. "),
                ScriptedModel::tool("c1", RUN_SELECT, "SELECT COUNT(*) FROM orders"),
                ScriptedModel::text("Twelve orders."),
                ScriptedModel::finish(None),
            ]),
            ScriptedExecutor::new(),
        );
        let events = turn(&orch, TurnRequest::new("How many orders are there?")).await;
        assert_eq!(
            kinds(&events),
            vec!["start", "delta", "tool_start", "tool_done", "delta", "done"]
        );
        let terminal = events.iter().position(|e| e.is_terminal()).unwrap();
        assert_eq!(terminal, events.len() - 1);
    }

    #[tokio::test]
    async fn test_admin_step_limit_emits_error() {
        let settings = Settings {
            max_admin_steps: 2,
            ..Settings::default()
        };
        let (orch, _, _) = orchestrator_with(
            ScriptedModel::new()
                .with_modes([Mode::AdminAssist])
                .with_steps((0..5).map(|_| ScriptedModel::text("more "))),
            ScriptedExecutor::new(),
            settings,
        );
        let events = turn(&orch, TurnRequest::new("Tidy up")).await;
        assert_eq!(kinds(&events), vec!["start", "delta", "delta", "error"]);
    }

    #[tokio::test]
    async fn test_delete_abandons_pending_approvals() {
        let (orch, model, executor) = orchestrator(drop_model(), ScriptedExecutor::new());
        let events = turn(&orch, TurnRequest::new("Drop the staging table").in_session("s1")).await;
        let id = approval_id(&events);

        assert!(orch.delete_session(&SessionId::from("s1")).await);
        assert_eq!(
            orch.approval(&id).await.unwrap().status,
            ApprovalStatus::Abandoned
        );
        let err = orch
            .resolve_approval(&id.to_string(), Decision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Approval(ApprovalError::AlreadyResolved {
                status: ApprovalStatus::Abandoned,
                ..
            })
        ));
        assert!(executor.executed().is_empty());
        assert!(orch.session(&SessionId::from("s1")).await.is_none());
        assert!(model.forgotten().is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_in_flight_turn() {
        let (orch, _, executor) = orchestrator(
            ScriptedModel::new().with_modes([Mode::AdminAssist]).with_steps([
                ScriptedModel::tool("c1", RUN_SELECT, "SELECT COUNT(*) FROM staging_orders"),
                ScriptedModel::tool("c2", DROP_TABLE, "DROP TABLE staging_orders"),
            ]),
            ScriptedExecutor::new().with_delay(Duration::from_millis(100)),
        );
        let rx = orch.spawn_turn(TurnRequest::new("Drop the staging table").in_session("s1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(orch.delete_session(&SessionId::from("s1")).await);
        let events = collect(rx).await;
        let id = approval_id(&events);

        assert_eq!(
            orch.approval(&id).await.unwrap().status,
            ApprovalStatus::Abandoned
        );
        assert!(orch.pending_approvals().await.is_empty());
        assert_eq!(executor.count_matching("DROP TABLE"), 0);
    }

    #[tokio::test]
    async fn test_injected_stores_back_the_orchestrator() {
        let conversations = Arc::new(InMemoryConversationStore::new(5));
        let approvals = Arc::new(InMemoryApprovalStore::new());
        let orch = Arc::new(
            StreamingOrchestrator::new(
                Arc::new(drop_model()),
                Arc::new(ScriptedExecutor::new()),
                Settings::default(),
            )
            .with_conversation_store(conversations.clone())
            .with_approval_store(approvals.clone()),
        );
        let events = turn(&orch, TurnRequest::new("Drop the staging table").in_session("s1")).await;
        let id = approval_id(&events);

        assert_eq!(conversations.len().await, 1);
        let pending = approvals.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_id, id);

        orch.resolve_approval(&id.to_string(), Decision::Approve)
            .await
            .unwrap();
        assert_eq!(
            approvals.get(&id).await.unwrap().status,
            ApprovalStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_approvals_as_abandoned() {
        let settings = Settings {
            approval_ttl_secs: 0,
            ..Settings::default()
        };
        let (orch, _, executor) =
            orchestrator_with(drop_model(), ScriptedExecutor::new(), settings);
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;
        let id = approval_id(&events);

        let report = orch.sweep().await;
        assert_eq!(report.abandoned_approvals, 1);
        assert_eq!(report.evicted_sessions, 0);
        assert_eq!(
            orch.approval(&id).await.unwrap().status,
            ApprovalStatus::Abandoned
        );
        assert!(orch
            .resolve_approval(&id.to_string(), Decision::Approve)
            .await
            .is_err());
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions() {
        let settings = Settings {
            idle_timeout_secs: 0,
            ..Settings::default()
        };
        let (orch, model, _) = orchestrator_with(
            ScriptedModel::new()
                .with_generations([ScriptedModel::generation("SELECT 1", Some("m1"))]),
            ScriptedExecutor::new(),
            settings,
        );
        turn(&orch, TurnRequest::new("q").in_session("s1")).await;

        let report = orch.sweep().await;
        assert_eq!(report.evicted_sessions, 1);
        assert!(orch.sessions().await.is_empty());
        assert_eq!(model.forgotten(), vec![MemoryHandle::new("m1")]);
    }

    #[tokio::test]
    async fn test_turns_in_one_session_are_serialized() {
        let (orch, model, _) = orchestrator(
            ScriptedModel::new().with_generations([
                ScriptedModel::generation("SELECT 1", Some("m1")),
                ScriptedModel::generation("SELECT 2", Some("m2")),
            ]),
            ScriptedExecutor::new().with_delay(Duration::from_millis(20)),
        );
        let first = orch.spawn_turn(TurnRequest::new("a").in_session("s1"));
        let second = orch.spawn_turn(TurnRequest::new("b").in_session("s1"));
        let (_, _) = tokio::join!(collect(first), collect(second));

        // Whichever turn ran second saw the first turn's memory.
        assert_eq!(
            model.classify_memories(),
            vec![None, Some(MemoryHandle::new("m1"))]
        );
    }

    #[tokio::test]
    async fn test_approved_execution_survives_caller_going_away() {
        let (orch, _, executor) = orchestrator(
            drop_model(),
            ScriptedExecutor::new().with_delay(Duration::from_millis(100)),
        );
        let events = turn(&orch, TurnRequest::new("Drop the staging table")).await;
        let id = approval_id(&events).to_string();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            orch.resolve_approval(&id, Decision::Approve),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(executor.count_matching("DROP TABLE staging_orders"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_the_turn() {
        let (orch, model, executor) = orchestrator(
            ScriptedModel::new().with_modes([Mode::AdminAssist]).with_steps([
                ScriptedModel::text("Looking. "),
                ScriptedModel::tool("c1", RUN_SELECT, "SELECT * FROM orders"),
                ScriptedModel::text("Found them."),
                ScriptedModel::finish(None),
            ]),
            ScriptedExecutor::new().with_delay(Duration::from_millis(200)),
        );
        let mut rx = orch.spawn_turn(TurnRequest::new("Show me orders"));
        while let Some(event) = rx.recv().await {
            if event.kind() == "delta" {
                break;
            }
        }
        drop(rx);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(model.step_transcripts().len(), 2);
        assert!(executor.executed().is_empty());
    }
}
