#![forbid(unsafe_code)]

//! Interactive process orchestration engine.
//!
//! Runs external command-line tools as supervised sessions: output is
//! streamed to subscribers in order, interactive prompts are detected and
//! surfaced for answers, sessions can be terminated at any time, and every
//! finished session is appended to a JSONL command history.

pub mod config;
pub mod errors;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::SessionManager;
