//! Output and subscriber event models.

use serde::{Deserialize, Serialize};

use crate::models::prompt::PromptRequest;
use crate::models::session::{SessionHandle, SessionOutcome};

/// Which child stream produced a chunk of text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One immutable, ordered chunk of captured output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEvent {
    /// Session that produced the output.
    pub handle: SessionHandle,
    /// Stream the text was read from.
    pub source: StreamSource,
    /// One or more complete lines, or a final partial line at stream close.
    pub text: String,
    /// Strictly increasing per session.
    pub sequence: u64,
}

/// Event delivered to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Output chunk.
    Output(OutputEvent),
    /// The process is waiting for input.
    Prompt(PromptRequest),
    /// Session reached a terminal state; the last event on the channel apart
    /// from warnings.
    Finished(SessionOutcome),
    /// Non-fatal problem such as a failed history write.
    Warning {
        /// Session the warning belongs to.
        handle: SessionHandle,
        /// Human-readable description.
        message: String,
    },
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    /// Every event.
    #[default]
    All,
    /// Output events plus `Finished` and warnings.
    Output,
    /// Prompt requests plus `Finished` and warnings.
    Prompts,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    #[must_use]
    pub fn accepts(self, event: &SessionEvent) -> bool {
        match (self, event) {
            (Self::All, _)
            | (_, SessionEvent::Finished(_) | SessionEvent::Warning { .. })
            | (Self::Output, SessionEvent::Output(_))
            | (Self::Prompts, SessionEvent::Prompt(_)) => true,
            (Self::Output, SessionEvent::Prompt(_)) | (Self::Prompts, SessionEvent::Output(_)) => {
                false
            }
        }
    }
}
