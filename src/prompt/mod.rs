//! Prompt detection.
//!
//! Decides, from the not yet newline-terminated tail of a child's output,
//! whether the process is now blocked on interactive input. The wrapped tool
//! has no structured protocol, so detection is heuristic and lives behind the
//! [`PromptDetector`] trait; [`patterns::PatternPromptDetector`] is the
//! configurable regex implementation used by default.

pub mod patterns;

use std::sync::OnceLock;

use regex::Regex;

pub use patterns::PatternPromptDetector;

/// Result of evaluating an output tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The tail does not look like a prompt.
    NoPrompt,
    /// The tail looks like a prompt; carries the trimmed prompt text.
    Prompt(String),
}

impl Detection {
    /// Whether a prompt was detected.
    #[must_use]
    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::Prompt(_))
    }
}

/// Decides whether an output tail is an interactive prompt.
///
/// Implementations must be pure: the same tail always yields the same
/// result and no state is kept between calls or sessions.
pub trait PromptDetector: Send + Sync {
    /// Evaluate the unflushed output tail.
    fn evaluate(&self, tail: &str) -> Detection;
}

/// Remove ANSI CSI and OSC escape sequences from `text`.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").ok()
    });

    match pattern {
        Some(re) if text.contains('\x1b') => re.replace_all(text, "").into_owned(),
        _ => text.to_owned(),
    }
}
