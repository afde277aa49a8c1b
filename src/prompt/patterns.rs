//! Regex-based prompt detector.
//!
//! The last line of the tail (text after the final `\n` or `\r`, with ANSI
//! escapes removed) is matched against a [`RegexSet`]. Patterns are matched
//! against the untrimmed line so rules such as `>\s+$` can require trailing
//! whitespace; the reported prompt text is trimmed.
//!
//! The default rule set is
//! [`DEFAULT_PROMPT_PATTERNS`](crate::config::DEFAULT_PROMPT_PATTERNS).

use regex::RegexSet;
use tracing::debug;

use crate::config::PromptConfig;
use crate::prompt::{strip_ansi, Detection, PromptDetector};
use crate::{AppError, Result};

/// Prompt detector driven by a configurable set of regular expressions.
#[derive(Debug, Clone)]
pub struct PatternPromptDetector {
    set: RegexSet,
    patterns: Vec<String>,
}

impl PatternPromptDetector {
    /// Compile `patterns` into a detector.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern is not a valid regex.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let set = RegexSet::new(&patterns)
            .map_err(|err| AppError::Config(format!("invalid prompt pattern: {err}")))?;
        Ok(Self { set, patterns })
    }

    /// Build the detector described by `[prompt]` configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern is not a valid regex.
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        Self::new(config.patterns.iter().cloned())
    }

    /// Source strings of the compiled patterns, in match-index order.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl PromptDetector for PatternPromptDetector {
    fn evaluate(&self, tail: &str) -> Detection {
        let clean = strip_ansi(tail);
        let line = clean.rsplit(['\n', '\r']).next().unwrap_or_default();
        let prompt = line.trim();

        if prompt.is_empty() {
            return Detection::NoPrompt;
        }

        let matched: Vec<usize> = self.set.matches(line).into_iter().collect();
        if matched.is_empty() {
            return Detection::NoPrompt;
        }

        debug!(
            prompt,
            rules = ?matched.iter().map(|i| self.patterns[*i].as_str()).collect::<Vec<_>>(),
            "prompt pattern matched"
        );
        Detection::Prompt(prompt.to_owned())
    }
}
