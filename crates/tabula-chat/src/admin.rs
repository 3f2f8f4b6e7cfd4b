//! Admin tool-use loop.
//!
//! The model is asked for its next step until it finishes. Read-only tools
//! run inline and their output is appended to the transcript. A mutating
//! tool suspends the loop: the transcript and the pending call are captured
//! in a [`Continuation`], handed to the approval store, and the turn ends
//! with an `approval` event. Resolution later calls [`AdminToolLoop::proceed`]
//! or [`AdminToolLoop::abort`] with that continuation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tabula_core::audit::{AuditOutcome, AuditRecord, AuditSink};
use tabula_core::capability::{
    AdminStep, ExecutionError, ModelService, QueryExecutor, QueryOutput, ToolCall,
    TranscriptEntry,
};
use tabula_core::types::{
    ApprovalId, ApprovalStatus, MemoryHandle, SessionId, Timestamp, TokenUsage, ToolKind,
};

use crate::approval::{ApprovalStore, ApprovalSummary, NewApproval};
use crate::error::ChatError;
use crate::events::{TurnEmitter, TurnEvent};
use crate::tools::{run_tool, ToolRegistry};

/// Rows rendered into a tool observation.
const OBSERVATION_ROWS: usize = 20;

/// Suspended state of an admin turn waiting on approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub session_id: SessionId,
    pub model: String,
    pub memory: Option<MemoryHandle>,
    /// Transcript up to and including the pending tool call.
    pub transcript: Vec<TranscriptEntry>,
    pub pending_call: ToolCall,
    pub usage: TokenUsage,
    /// Model steps consumed so far.
    pub steps: usize,
}

/// How a stretch of the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminOutcome {
    Finished {
        usage: TokenUsage,
        /// Handle the model bound when finishing. `None` leaves the
        /// session's handle as it is.
        memory: Option<MemoryHandle>,
        answer: String,
    },
    Suspended {
        approval: ApprovalSummary,
        usage: TokenUsage,
        answer: String,
    },
}

impl AdminOutcome {
    pub fn usage(&self) -> TokenUsage {
        match self {
            AdminOutcome::Finished { usage, .. } | AdminOutcome::Suspended { usage, .. } => *usage,
        }
    }

    /// Handle bound during this stretch, if any.
    pub fn memory(&self) -> Option<&MemoryHandle> {
        match self {
            AdminOutcome::Finished { memory, .. } => memory.as_ref(),
            AdminOutcome::Suspended { .. } => None,
        }
    }

    pub fn answer(&self) -> &str {
        match self {
            AdminOutcome::Finished { answer, .. } | AdminOutcome::Suspended { answer, .. } => {
                answer
            }
        }
    }
}

struct LoopState {
    session_id: SessionId,
    model: String,
    memory: Option<MemoryHandle>,
    transcript: Vec<TranscriptEntry>,
    usage: TokenUsage,
    steps: usize,
    answer: String,
}

impl From<Continuation> for LoopState {
    fn from(continuation: Continuation) -> Self {
        Self {
            session_id: continuation.session_id,
            model: continuation.model,
            memory: continuation.memory,
            transcript: continuation.transcript,
            usage: continuation.usage,
            steps: continuation.steps,
            answer: String::new(),
        }
    }
}

pub struct AdminToolLoop {
    model: Arc<dyn ModelService>,
    executor: Arc<dyn QueryExecutor>,
    approvals: Arc<dyn ApprovalStore>,
    audit: Arc<dyn AuditSink>,
    registry: ToolRegistry,
    max_steps: usize,
}

impl AdminToolLoop {
    pub fn new(
        model: Arc<dyn ModelService>,
        executor: Arc<dyn QueryExecutor>,
        approvals: Arc<dyn ApprovalStore>,
        audit: Arc<dyn AuditSink>,
        max_steps: usize,
    ) -> Self {
        Self {
            model,
            executor,
            approvals,
            audit,
            registry: ToolRegistry::builtin(),
            max_steps,
        }
    }

    /// Start a fresh admin turn.
    pub async fn run(
        &self,
        session_id: &SessionId,
        question: &str,
        memory: Option<MemoryHandle>,
        model: &str,
        emitter: &mut TurnEmitter,
    ) -> Result<AdminOutcome, ChatError> {
        let state = LoopState {
            session_id: session_id.clone(),
            model: model.to_string(),
            memory,
            transcript: vec![TranscriptEntry::User {
                text: question.to_string(),
            }],
            usage: TokenUsage::default(),
            steps: 0,
            answer: String::new(),
        };
        self.drive(state, emitter).await
    }

    /// Execute an approved call, then resume the loop with its result.
    pub async fn proceed(
        &self,
        approval_id: ApprovalId,
        continuation: Continuation,
        emitter: &mut TurnEmitter,
    ) -> Result<AdminOutcome, ChatError> {
        let call = continuation.pending_call.clone();
        let mut state = LoopState::from(continuation);

        // Approved work runs whether or not anyone is still listening.
        emitter
            .emit(TurnEvent::ToolStart {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                kind: ToolKind::Mutating,
                arguments: call.arguments.clone(),
            })
            .await;

        info!(approval_id = %approval_id, tool = %call.name, "Executing approved tool call");
        let result = run_tool(self.executor.as_ref(), &call).await;

        let (outcome, detail) = match &result {
            Ok(output) => (AuditOutcome::Succeeded, output.render(0)),
            Err(e) => (AuditOutcome::Failed, e.to_string()),
        };
        self.audit
            .record(AuditRecord {
                approval_id,
                session_id: state.session_id.clone(),
                tool_name: call.name.clone(),
                statement: call
                    .statement()
                    .map(str::to_string)
                    .unwrap_or_else(|| call.arguments.to_string()),
                outcome,
                detail,
                executed_at: Timestamp::now(),
            })
            .await;

        self.observe(&mut state, &call, result, emitter).await?;
        self.drive(state, emitter).await
    }

    /// Resume the loop with a cancellation notice instead of executing.
    pub async fn abort(
        &self,
        continuation: Continuation,
        status: ApprovalStatus,
        emitter: &mut TurnEmitter,
    ) -> Result<AdminOutcome, ChatError> {
        let call = continuation.pending_call.clone();
        let mut state = LoopState::from(continuation);
        let notice = format!("Cancelled: {} was {} and did not run.", call.name, status);
        debug!(tool = %call.name, status = %status, "Approval not granted");

        state.transcript.push(TranscriptEntry::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: notice.clone(),
            is_error: true,
        });
        send(
            emitter,
            TurnEvent::ToolDone {
                tool_name: call.name,
                call_id: call.id,
                is_error: true,
                output: notice,
            },
        )
        .await?;
        self.drive(state, emitter).await
    }

    async fn drive(
        &self,
        mut state: LoopState,
        emitter: &mut TurnEmitter,
    ) -> Result<AdminOutcome, ChatError> {
        loop {
            if state.steps >= self.max_steps {
                warn!(
                    steps = state.steps,
                    session_id = %state.session_id,
                    "Admin step limit reached"
                );
                return Err(ChatError::StepLimit(self.max_steps));
            }
            state.steps += 1;

            let step = self
                .model
                .next_step(&state.transcript, state.memory.as_ref(), &state.model)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Admin step generation failed");
                    ChatError::Generation(e)
                })?;

            match step {
                AdminStep::Text { text, usage } => {
                    state.usage += usage;
                    state.answer.push_str(&text);
                    state.transcript.push(TranscriptEntry::Assistant { text: text.clone() });
                    send(emitter, TurnEvent::Delta { text }).await?;
                }
                AdminStep::ToolCall { call, usage } => {
                    state.usage += usage;
                    state
                        .transcript
                        .push(TranscriptEntry::ToolCall { call: call.clone() });

                    match self.registry.kind_of(&call) {
                        ToolKind::ReadOnly => {
                            send(
                                emitter,
                                TurnEvent::ToolStart {
                                    tool_name: call.name.clone(),
                                    call_id: call.id.clone(),
                                    kind: ToolKind::ReadOnly,
                                    arguments: call.arguments.clone(),
                                },
                            )
                            .await?;
                            let result = run_tool(self.executor.as_ref(), &call).await;
                            self.observe(&mut state, &call, result, emitter).await?;
                        }
                        ToolKind::Mutating => return self.suspend(state, call, emitter).await,
                    }
                }
                AdminStep::Finish { usage, memory } => {
                    state.usage += usage;
                    return Ok(AdminOutcome::Finished {
                        usage: state.usage,
                        memory,
                        answer: state.answer,
                    });
                }
            }
        }
    }

    /// Record a tool result. Rejections become error observations; an
    /// unreachable engine ends the turn.
    async fn observe(
        &self,
        state: &mut LoopState,
        call: &ToolCall,
        result: Result<QueryOutput, ExecutionError>,
        emitter: &mut TurnEmitter,
    ) -> Result<(), ChatError> {
        let (output, is_error) = match result {
            Ok(output) => (output.render(OBSERVATION_ROWS), false),
            Err(ExecutionError::Rejected(reason)) => {
                debug!(tool = %call.name, reason = %reason, "Tool call rejected");
                (format!("error: {}", reason), true)
            }
            Err(e @ ExecutionError::Unavailable(_)) => {
                warn!(tool = %call.name, error = %e, "Execution engine unavailable");
                return Err(ChatError::Execution(e));
            }
        };

        state.transcript.push(TranscriptEntry::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: output.clone(),
            is_error,
        });
        send(
            emitter,
            TurnEvent::ToolDone {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                is_error,
                output,
            },
        )
        .await
    }

    async fn suspend(
        &self,
        state: LoopState,
        call: ToolCall,
        emitter: &mut TurnEmitter,
    ) -> Result<AdminOutcome, ChatError> {
        let proposed_action = call
            .statement()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {}", call.name, call.arguments));
        let explanation = call
            .explanation
            .clone()
            .unwrap_or_else(|| format!("{} may change the data source", call.name));

        let approval = self
            .approvals
            .create(NewApproval {
                session_id: state.session_id.clone(),
                tool_name: call.name.clone(),
                proposed_action: proposed_action.clone(),
                explanation: explanation.clone(),
                continuation: Continuation {
                    session_id: state.session_id.clone(),
                    model: state.model.clone(),
                    memory: state.memory.clone(),
                    transcript: state.transcript,
                    pending_call: call,
                    usage: state.usage,
                    steps: state.steps,
                },
            })
            .await;

        info!(
            approval_id = %approval.approval_id,
            session_id = %state.session_id,
            tool = %approval.tool_name,
            "Mutating tool call awaiting approval"
        );

        // The approval exists even if the client has gone; it expires unclaimed.
        emitter
            .emit(TurnEvent::Approval {
                approval_id: approval.approval_id,
                tool_name: approval.tool_name.clone(),
                proposed_action,
                explanation,
            })
            .await;

        Ok(AdminOutcome::Suspended {
            approval,
            usage: state.usage,
            answer: state.answer,
        })
    }
}

/// Emit an event, failing the turn if the receiver has gone away.
async fn send(emitter: &mut TurnEmitter, event: TurnEvent) -> Result<(), ChatError> {
    if !emitter.emit(event).await && emitter.is_closed() {
        return Err(ChatError::StreamInterrupted);
    }
    Ok(())
}
