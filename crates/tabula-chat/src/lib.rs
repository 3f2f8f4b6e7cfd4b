//! Conversational query orchestration for Tabula.
//!
//! Turns a natural-language question into a streamed response: intent
//! routing, retry-bounded query generation, the admin tool-use loop with
//! human approval for mutating actions, and the per-session conversation
//! and approval stores behind them.

pub mod admin;
pub mod approval;
pub mod error;
pub mod events;
pub mod generator;
pub mod orchestrator;
pub mod router;
pub mod rules;
pub mod scripted;
pub mod session;
pub mod tools;

pub use admin::{AdminOutcome, AdminToolLoop, Continuation};
pub use approval::{ApprovalStore, ApprovalSummary, InMemoryApprovalStore, NewApproval};
pub use error::{ApprovalError, ChatError};
pub use events::{FullResponse, TurnEmitter, TurnEvent};
pub use generator::{GenerationOutcome, RetryBoundedGenerator};
pub use orchestrator::{
    ApprovalResolution, OrchestratorStats, Settings, StreamingOrchestrator, SweepReport,
    TurnRequest,
};
pub use router::IntentRouter;
pub use rules::RuleModel;
pub use scripted::{ScriptedExecutor, ScriptedModel};
pub use session::{
    ConversationStore, InMemoryConversationStore, SessionRecord, SessionSummary, TurnOutcome,
    TurnRecord,
};
pub use tools::{ToolRegistry, ToolSpec};
