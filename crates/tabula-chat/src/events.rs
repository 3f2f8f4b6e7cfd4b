//! Turn events and the ordered emitter that streams them.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use tabula_core::types::{ApprovalId, Mode, SessionId, TokenUsage, ToolKind};

/// Complete payload of a data-query turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullResponse {
    pub session_id: SessionId,
    pub mode: Mode,
    pub model: String,
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub retries: u32,
    pub truncated: bool,
    pub elapsed_time: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tokens_total: u64,
}

/// Events sent to the client during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Resolved session and mode
    #[serde(rename_all = "camelCase")]
    Start {
        session_id: SessionId,
        mode: Mode,
        model: String,
    },
    /// Incremental admin text
    Delta { text: String },
    #[serde(rename_all = "camelCase")]
    ToolStart {
        tool_name: String,
        call_id: String,
        kind: ToolKind,
        arguments: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolDone {
        tool_name: String,
        call_id: String,
        is_error: bool,
        output: String,
    },
    /// A mutating tool is waiting for a human decision
    #[serde(rename_all = "camelCase")]
    Approval {
        approval_id: ApprovalId,
        tool_name: String,
        proposed_action: String,
        explanation: String,
    },
    FullResponse(FullResponse),
    #[serde(rename_all = "camelCase")]
    Done {
        elapsed_time: f64,
        tokens_in: u64,
        tokens_out: u64,
        tokens_total: u64,
    },
    Error { message: String },
}

impl TurnEvent {
    pub fn done(elapsed_time: f64, usage: TokenUsage) -> Self {
        TurnEvent::Done {
            elapsed_time,
            tokens_in: usage.input,
            tokens_out: usage.output,
            tokens_total: usage.total(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TurnEvent::Error {
            message: message.into(),
        }
    }

    /// Events after which nothing else may be emitted for the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Done { .. } | TurnEvent::Error { .. } | TurnEvent::Approval { .. }
        )
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::Start { .. } => "start",
            TurnEvent::Delta { .. } => "delta",
            TurnEvent::ToolStart { .. } => "tool_start",
            TurnEvent::ToolDone { .. } => "tool_done",
            TurnEvent::Approval { .. } => "approval",
            TurnEvent::FullResponse(_) => "full_response",
            TurnEvent::Done { .. } => "done",
            TurnEvent::Error { .. } => "error",
        }
    }
}

/// Ordered event sink for one turn.
///
/// Once a terminal event has gone out, further events are dropped, so a
/// stream never carries a `delta` after `done`, `error` or `approval`.
pub struct TurnEmitter {
    tx: mpsc::Sender<TurnEvent>,
    finished: bool,
}

impl TurnEmitter {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self {
            tx,
            finished: false,
        }
    }

    /// Send one event. Returns false when the event was dropped, either
    /// because the turn already ended or because the receiver is gone.
    pub async fn emit(&mut self, event: TurnEvent) -> bool {
        if self.finished {
            debug!(event = event.kind(), "Dropping event after terminal event");
            return false;
        }
        self.finished = event.is_terminal();
        self.tx.send(event).await.is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
