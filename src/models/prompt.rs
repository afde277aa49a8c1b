//! Prompt request model.

use serde::{Deserialize, Serialize};

use crate::models::output::StreamSource;
use crate::models::session::SessionHandle;

/// Signal that the process is blocked waiting for input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptRequest {
    /// Session awaiting input.
    pub handle: SessionHandle,
    /// Trimmed prompt text shown before the process stalled.
    pub prompt_text: String,
    /// Stream the prompt appeared on.
    pub source: StreamSource,
    /// Sequence number of the last output event delivered before the prompt.
    pub after_sequence: u64,
}
