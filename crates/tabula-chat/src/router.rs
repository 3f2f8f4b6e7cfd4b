//! Intent router: one classification call per turn.

use std::sync::Arc;

use tracing::{debug, warn};

use tabula_core::capability::ModelService;
use tabula_core::types::{MemoryHandle, Mode};

use crate::error::ChatError;

pub struct IntentRouter {
    model: Arc<dyn ModelService>,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn ModelService>) -> Self {
        Self { model }
    }

    /// Classify a question. Any model failure is fatal to the turn.
    pub async fn classify(
        &self,
        question: &str,
        memory: Option<&MemoryHandle>,
        model: &str,
    ) -> Result<Mode, ChatError> {
        match self.model.classify(question, memory, model).await {
            Ok(mode) => {
                debug!(mode = %mode, provider = self.model.name(), "Question classified");
                Ok(mode)
            }
            Err(e) => {
                warn!(error = %e, provider = self.model.name(), "Classification failed");
                Err(ChatError::Classification(e))
            }
        }
    }
}
