//! History log reader.
//!
//! Parses every `history-*.jsonl` file in a directory back into
//! [`HistoryRecord`]s ordered by timestamp. Malformed lines (including a
//! final line truncated by a crash) are skipped with a warning and never
//! affect well-formed records around them.

use std::fs;
use std::path::Path;

use tracing::warn;

use super::writer::{FILE_PREFIX, FILE_SUFFIX};
use super::HistoryRecord;
use crate::{AppError, Result};

/// Parse the contents of one history file.
///
/// Blank and malformed lines are skipped.
#[must_use]
pub fn parse_history(contents: &str) -> Vec<HistoryRecord> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(line = index + 1, %err, "skipping malformed history line");
                None
            }
        })
        .collect()
}

/// Read all history records in `dir`, oldest first.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the directory or a history file exists but
/// cannot be read.
pub fn read_history(dir: &Path) -> Result<Vec<HistoryRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<_> = fs::read_dir(dir)
        .map_err(|e| AppError::Io(format!("failed to list {}: {e}", dir.display())))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX))
        })
        .collect();
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let bytes = fs::read(&path)
            .map_err(|e| AppError::Io(format!("failed to read {}: {e}", path.display())))?;
        records.extend(parse_history(&String::from_utf8_lossy(&bytes)));
    }

    records.sort_by_key(|record| record.timestamp);
    Ok(records)
}
