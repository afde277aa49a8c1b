//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering all domain failure modes.
///
/// Non-zero exits and signal deaths of the child process are **not** errors;
/// they are terminal session states reported through
/// [`SessionOutcome`](crate::models::session::SessionOutcome).
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The executable could not be launched; no session was created.
    Spawn(String),
    /// Operation invoked while the session is not in the expected state.
    InvalidState(String),
    /// Output volume exceeded internal buffering; the session was killed.
    BufferOverflow(String),
    /// Writing to the child's standard input failed.
    WriteFailure(String),
    /// Appending to the command history failed (non-fatal).
    HistoryWrite(String),
    /// Requested session does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::BufferOverflow(msg) => write!(f, "buffer overflow: {msg}"),
            Self::WriteFailure(msg) => write!(f, "write failure: {msg}"),
            Self::HistoryWrite(msg) => write!(f, "history write: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::HistoryWrite(format!("serialization failed: {err}"))
    }
}
