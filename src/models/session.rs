//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Opaque identifier for one session, unique for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    /// Generate a fresh handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a session.
///
/// `Completed`, `Terminated` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process is being launched; no process handle yet.
    Spawning,
    /// Process is running and output is being streamed.
    Running,
    /// A prompt was detected and the session waits for caller input.
    WaitingForInput,
    /// Process exited on its own (any exit code).
    Completed,
    /// Process was killed by `terminate` or an auto-termination policy.
    Terminated,
    /// Spawn failed or the session was killed for overflowing its buffers.
    Failed,
}

impl SessionState {
    /// Whether no further transition can leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Failed)
    }

    /// Whether the session still owns a live process.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Spawning, Self::Running | Self::Failed)
                | (Self::Running, Self::WaitingForInput)
                | (Self::WaitingForInput, Self::Running)
                | (
                    Self::Running | Self::WaitingForInput,
                    Self::Completed | Self::Terminated | Self::Failed
                )
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Everything needed to launch one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Executable name or path.
    pub command: String,
    /// Optional subcommand placed before the positional arguments.
    pub subcommand: Option<String>,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_directory: PathBuf,
    /// Caller-chosen channel key; at most one active session per channel.
    pub channel: Option<String>,
}

impl SpawnRequest {
    /// Construct a request with no subcommand, arguments or channel.
    #[must_use]
    pub fn new(command: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            subcommand: None,
            args: Vec::new(),
            working_directory: working_directory.into(),
            channel: None,
        }
    }

    /// Set the subcommand.
    #[must_use]
    pub fn with_subcommand(mut self, subcommand: impl Into<String>) -> Self {
        self.subcommand = Some(subcommand.into());
        self
    }

    /// Append positional arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bind the session to a logical channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Arguments passed to the executable: subcommand first, then `args`.
    #[must_use]
    pub fn child_args(&self) -> Vec<String> {
        self.subcommand
            .iter()
            .chain(self.args.iter())
            .cloned()
            .collect()
    }

    /// Full argv including the executable.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.child_args())
            .collect()
    }

    /// Human-readable command line with shell-style quoting where needed.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| quote_arg(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote `arg` with single quotes if it is empty or contains shell-special
/// characters.
fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// One live or completed invocation of the external process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Unique session handle.
    pub handle: SessionHandle,
    /// Executable name or path.
    pub command: String,
    /// Optional subcommand.
    pub subcommand: Option<String>,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_directory: PathBuf,
    /// Channel the session is bound to, if any.
    pub channel: Option<String>,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Accumulated standard output.
    pub stdout: String,
    /// Accumulated standard error.
    pub stderr: String,
    /// Prompt text awaiting input, when `state` is `WaitingForInput`.
    pub pending_prompt: Option<String>,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
    /// Why the session ended, for terminal states.
    pub reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state or output change.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a new session in `Spawning` state.
    #[must_use]
    pub fn new(handle: SessionHandle, request: &SpawnRequest) -> Self {
        let now = Utc::now();
        Self {
            handle,
            command: request.command.clone(),
            subcommand: request.subcommand.clone(),
            args: request.args.clone(),
            working_directory: request.working_directory.clone(),
            channel: request.channel.clone(),
            pid: None,
            state: SessionState::Spawning,
            stdout: String::new(),
            stderr: String::new(),
            pending_prompt: None,
            exit_code: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the transition is not permitted.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "session {} cannot move from {} to {next}",
                self.handle, self.state
            )));
        }
        self.state = next;
        if next != SessionState::WaitingForInput {
            self.pending_prompt = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Total bytes captured across both streams.
    #[must_use]
    pub fn captured_bytes(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    /// Summarise the session for a caller once it is terminal.
    #[must_use]
    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            handle: self.handle,
            state: self.state,
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Final result of a session, delivered once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Session the outcome belongs to.
    pub handle: SessionHandle,
    /// Terminal state.
    pub state: SessionState,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Human-readable reason for the terminal state.
    pub reason: Option<String>,
}

impl SessionOutcome {
    /// Completed with exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.state == SessionState::Completed && self.exit_code == Some(0)
    }

    /// Text a caller should surface: stdout on success, otherwise stderr
    /// (falling back to the terminal reason).
    #[must_use]
    pub fn result_text(&self) -> String {
        if self.success() {
            return self.stdout.clone();
        }
        if self.stderr.trim().is_empty() {
            self.reason.clone().unwrap_or_default()
        } else {
            self.stderr.clone()
        }
    }
}
