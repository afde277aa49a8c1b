//! Durable command history.
//!
//! Provides the [`HistoryRecorder`] trait and associated types. The primary
//! implementation, [`JsonlHistoryWriter`], appends JSONL records to
//! daily-rotating files in the configured history directory;
//! [`reader::read_history`] parses them back in timestamp order.

pub mod reader;
pub mod writer;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::session::{SessionHandle, SessionOutcome, SessionState, SpawnRequest};

/// How the recorded session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    /// Process exited on its own (any exit code).
    #[default]
    Completed,
    /// Spawn failed or the session overflowed its buffers.
    Failed,
    /// Process was killed.
    Terminated,
}

impl From<SessionState> for HistoryOutcome {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Terminated => Self::Terminated,
            SessionState::Failed | SessionState::Spawning => Self::Failed,
            SessionState::Running | SessionState::WaitingForInput | SessionState::Completed => {
                Self::Completed
            }
        }
    }
}

/// One immutable audit entry for a finished session.
///
/// New fields must be optional with `#[serde(default)]` so older log files
/// keep parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    /// When the session finished.
    pub timestamp: DateTime<Utc>,
    /// Session the record belongs to (absent for spawn failures).
    #[serde(default)]
    pub session: Option<SessionHandle>,
    /// Full command line as shown to the operator.
    pub command_line: String,
    /// Exact argv, executable first.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Working directory the command ran in.
    pub working_directory: PathBuf,
    /// Terminal classification.
    #[serde(default)]
    pub outcome: HistoryOutcome,
    /// Exit code when the process exited normally.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Captured result: stdout on success, error text otherwise.
    pub result: String,
    /// Wall-clock runtime in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl HistoryRecord {
    /// Construct a record for `request` with the current timestamp.
    #[must_use]
    pub fn new(request: &SpawnRequest, outcome: HistoryOutcome, result: String) -> Self {
        Self {
            timestamp: Utc::now(),
            session: None,
            command_line: request.command_line(),
            argv: request.argv(),
            working_directory: request.working_directory.clone(),
            outcome,
            exit_code: None,
            result,
            duration_ms: None,
        }
    }

    /// Build the record for a finished session.
    #[must_use]
    pub fn from_outcome(
        request: &SpawnRequest,
        outcome: &SessionOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(request, outcome.state.into(), outcome.result_text());
        record.session = Some(outcome.handle);
        record.exit_code = outcome.exit_code;
        record.duration_ms = u64::try_from(
            record
                .timestamp
                .signed_duration_since(started_at)
                .num_milliseconds(),
        )
        .ok();
        record
    }
}

/// Writes history records to a persistent, append-only store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// sessions via [`std::sync::Arc`], and must serialize concurrent appends.
pub trait HistoryRecorder: Send + Sync {
    /// Append a single record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::HistoryWrite`](crate::AppError::HistoryWrite) if
    /// the underlying write fails.
    fn record(&self, record: HistoryRecord) -> crate::Result<()>;
}

pub use reader::read_history;
pub use writer::JsonlHistoryWriter;
