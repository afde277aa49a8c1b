//! JSONL history writer with daily file rotation.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{NaiveDate, Utc};
use tracing::warn;

use super::{HistoryRecord, HistoryRecorder};
use crate::{AppError, Result};

/// File name prefix shared with the reader.
pub(crate) const FILE_PREFIX: &str = "history-";
/// File name suffix shared with the reader.
pub(crate) const FILE_SUFFIX: &str = ".jsonl";

/// Internal state protected by a mutex.
struct WriterState {
    current_date: NaiveDate,
    writer: BufWriter<File>,
}

/// A daily-rotating JSONL history writer.
///
/// Appends one JSON object per line to `<dir>/history-YYYY-MM-DD.jsonl`.
/// Automatically opens a new file when the calendar date changes between
/// writes. All appends go through one mutex, so concurrent sessions never
/// interleave partial lines.
pub struct JsonlHistoryWriter {
    dir: PathBuf,
    state: Mutex<Option<WriterState>>,
}

impl JsonlHistoryWriter {
    /// Construct a writer that stores history in `dir`.
    ///
    /// Creates `dir` and all parent directories if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Config(format!(
                "failed to create history directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            state: Mutex::new(None),
        })
    }

    /// Directory the writer appends to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `date`.
    #[must_use]
    pub fn file_for_date(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("{FILE_PREFIX}{date}{FILE_SUFFIX}"))
    }

    fn open_for_date(dir: &Path, date: NaiveDate) -> Result<BufWriter<File>> {
        let path = Self::file_for_date(dir, date);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                AppError::HistoryWrite(format!("failed to open history {}: {e}", path.display()))
            })?;

        // A crash mid-append can leave a truncated last line; start the next
        // record on a fresh line so it stays parseable.
        if ends_without_newline(&mut file)? {
            file.write_all(b"\n").map_err(|e| {
                AppError::HistoryWrite(format!("failed to repair history {}: {e}", path.display()))
            })?;
        }

        Ok(BufWriter::new(file))
    }
}

fn ends_without_newline(file: &mut File) -> Result<bool> {
    let len = file
        .metadata()
        .map_err(|e| AppError::HistoryWrite(format!("failed to stat history: {e}")))?
        .len();
    if len == 0 {
        return Ok(false);
    }

    let mut last = [0_u8; 1];
    file.seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| AppError::HistoryWrite(format!("failed to inspect history: {e}")))?;
    Ok(last[0] != b'\n')
}

impl HistoryRecorder for JsonlHistoryWriter {
    fn record(&self, record: HistoryRecord) -> Result<()> {
        let today = Utc::now().date_naive();

        let mut guard = self
            .state
            .lock()
            .map_err(|_| AppError::HistoryWrite("history writer mutex poisoned".to_string()))?;

        let needs_rotation = guard.as_ref().is_none_or(|s| s.current_date != today);

        if needs_rotation {
            let new_writer = Self::open_for_date(&self.dir, today)?;
            *guard = Some(WriterState {
                current_date: today,
                writer: new_writer,
            });
        }

        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(&record)?;
        let written = writeln!(state.writer, "{line}").and_then(|()| state.writer.flush());

        if let Err(e) = written {
            warn!("failed to write history record: {e}");
            // Discard the unflushed bytes; the next record reopens the file
            // and repairs a torn last line.
            if let Some(state) = guard.take() {
                let (_file, _unflushed) = state.writer.into_parts();
            }
            return Err(AppError::HistoryWrite(format!("history write failed: {e}")));
        }

        Ok(())
    }
}
