//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Default prompt patterns matched against the unflushed output tail.
///
/// | Pattern                     | Matches                         |
/// |-----------------------------|---------------------------------|
/// | `[:?]\s*$`                  | `Enter name: `, `Continue?`     |
/// | `>\s+$`                     | `> `, `identity> `              |
/// | `\[[yYnN]/[yYnN]\]\s*$`     | `Proceed [y/N] `                |
/// | `\([yYnN]/[yYnN]\)\s*$`     | `Overwrite (y/n) `              |
pub const DEFAULT_PROMPT_PATTERNS: &[&str] = &[
    r"[:?]\s*$",
    r">\s+$",
    r"\[[yYnN]/[yYnN]\]\s*$",
    r"\([yYnN]/[yYnN]\)\s*$",
];

/// Process spawning and buffering limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Executable used by the CLI when no command is given explicitly.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Environment variables passed through to the child.
    ///
    /// Empty means the child inherits the full environment; otherwise the
    /// environment is cleared and only the listed variables are copied.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Spawn the child in its own process group so termination reaches
    /// grandchildren too (Unix only).
    #[serde(default = "default_true")]
    pub kill_process_group: bool,
    /// Capacity of the per-session reader and subscriber channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Maximum accumulated stdout + stderr bytes before `BufferOverflow`.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
    /// Longest partial line held back before it is flushed as output.
    #[serde(default = "default_max_partial_line_bytes")]
    pub max_partial_line_bytes: usize,
    /// How long a subscriber may refuse events before `BufferOverflow`.
    #[serde(default = "default_subscriber_stall_ms")]
    pub subscriber_stall_timeout_ms: u64,
    /// Grace period for reaping a killed process.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// How long to keep draining output after the process exits.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_executable() -> String {
    "dfx".into()
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    256
}

fn default_max_capture_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_partial_line_bytes() -> usize {
    64 * 1024
}

fn default_subscriber_stall_ms() -> u64 {
    10_000
}

fn default_terminate_grace_ms() -> u64 {
    2_000
}

fn default_drain_timeout_ms() -> u64 {
    2_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            env_allowlist: Vec::new(),
            kill_process_group: default_true(),
            event_buffer: default_event_buffer(),
            max_capture_bytes: default_max_capture_bytes(),
            max_partial_line_bytes: default_max_partial_line_bytes(),
            subscriber_stall_timeout_ms: default_subscriber_stall_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Subscriber stall timeout as a [`Duration`].
    #[must_use]
    pub fn subscriber_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_stall_timeout_ms)
    }

    /// Kill grace period as a [`Duration`].
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Post-exit drain timeout as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Prompt detection rules.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PromptConfig {
    /// Silence required after non-newline-terminated output before the tail
    /// is evaluated; 0 evaluates immediately.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Regular expressions matched against the unflushed tail.
    #[serde(default = "default_prompt_patterns")]
    pub patterns: Vec<String>,
}

fn default_quiet_period_ms() -> u64 {
    150
}

fn default_prompt_patterns() -> Vec<String> {
    DEFAULT_PROMPT_PATTERNS
        .iter()
        .map(|p| (*p).to_owned())
        .collect()
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            patterns: default_prompt_patterns(),
        }
    }
}

impl PromptConfig {
    /// Quiet period as a [`Duration`].
    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

/// Auto-termination thresholds (seconds); 0 disables a threshold.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Terminate after this long with no output and no operator input.
    #[serde(default)]
    pub idle_seconds: u64,
    /// Terminate after this long regardless of activity.
    #[serde(default)]
    pub max_runtime_seconds: u64,
}

impl TimeoutConfig {
    /// Idle threshold, or `None` when disabled.
    #[must_use]
    pub fn idle(&self) -> Option<Duration> {
        (self.idle_seconds > 0).then(|| Duration::from_secs(self.idle_seconds))
    }

    /// Absolute runtime cap, or `None` when disabled.
    #[must_use]
    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_seconds > 0).then(|| Duration::from_secs(self.max_runtime_seconds))
    }
}

fn default_history_dir() -> PathBuf {
    PathBuf::from(".command-assist").join("history")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the JSONL command history.
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    /// Whether sessions are recorded to the history log.
    #[serde(default = "default_true")]
    pub record_history: bool,
    /// Process spawning and buffering limits.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Prompt detection rules.
    #[serde(default)]
    pub prompt: PromptConfig,
    /// Auto-termination thresholds.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            record_history: true,
            engine: EngineConfig::default(),
            prompt: PromptConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits and compile every prompt pattern once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.engine.event_buffer == 0 {
            return Err(AppError::Config(
                "engine.event_buffer must be greater than zero".into(),
            ));
        }

        if self.engine.max_capture_bytes == 0 {
            return Err(AppError::Config(
                "engine.max_capture_bytes must be greater than zero".into(),
            ));
        }

        if self.engine.max_partial_line_bytes == 0 {
            return Err(AppError::Config(
                "engine.max_partial_line_bytes must be greater than zero".into(),
            ));
        }

        if self.prompt.patterns.is_empty() {
            return Err(AppError::Config(
                "prompt.patterns must not be empty".into(),
            ));
        }

        for pattern in &self.prompt.patterns {
            regex::Regex::new(pattern).map_err(|err| {
                AppError::Config(format!("invalid prompt pattern {pattern:?}: {err}"))
            })?;
        }

        Ok(())
    }
}
