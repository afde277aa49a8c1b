//! Line-buffering codec for child output streams.
//!
//! Complete lines are released as soon as their newline arrives. Text after
//! the last newline is held back: it is reported once per growth as a
//! [`Frame::Partial`] (so the prompt detector can look at it) but stays in the
//! buffer until a newline arrives or the stream closes, at which point it is
//! released as part of a [`Frame::Lines`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use command_assist::stream::codec::OutputCodec;
//!
//! let frames = FramedRead::new(child_stdout, OutputCodec::new(64 * 1024));
//! ```

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// One decoded unit of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One or more complete lines (newlines included), or the final partial
    /// line flushed at end of stream.
    Lines(String),
    /// Snapshot of the held, not yet newline-terminated tail.
    ///
    /// The bytes are **not** consumed; they reappear inside a later
    /// [`Frame::Lines`].
    Partial(String),
}

/// Line-buffering decoder with a cap on how long a partial line may grow.
#[derive(Debug)]
pub struct OutputCodec {
    max_partial_bytes: usize,
    reported_len: usize,
}

impl OutputCodec {
    /// Create a codec that flushes partial lines longer than
    /// `max_partial_bytes`.
    #[must_use]
    pub fn new(max_partial_bytes: usize) -> Self {
        Self {
            max_partial_bytes: max_partial_bytes.max(1),
            reported_len: 0,
        }
    }

    fn take(&mut self, src: &mut BytesMut, len: usize) -> Frame {
        let chunk = src.split_to(len);
        self.reported_len = 0;
        Frame::Lines(String::from_utf8_lossy(&chunk).into_owned())
    }
}

impl Decoder for OutputCodec {
    type Item = Frame;
    type Error = AppError;

    /// Release every complete line in `src`, or report the held tail if it
    /// grew since the last call.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(pos) = src.iter().rposition(|b| *b == b'\n') {
            return Ok(Some(self.take(src, pos + 1)));
        }

        if src.len() > self.max_partial_bytes {
            let cut = utf8_boundary(src, self.max_partial_bytes);
            return Ok(Some(self.take(src, cut)));
        }

        if !src.is_empty() && src.len() != self.reported_len {
            self.reported_len = src.len();
            return Ok(Some(Frame::Partial(
                String::from_utf8_lossy(src).into_owned(),
            )));
        }

        Ok(None)
    }

    /// Flush everything left, including a trailing partial line.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.is_empty() {
            return Ok(None);
        }
        if let Some(pos) = src.iter().rposition(|b| *b == b'\n') {
            return Ok(Some(self.take(src, pos + 1)));
        }
        let len = src.len();
        Ok(Some(self.take(src, len)))
    }
}

/// Largest cut point `<= max` that does not split a UTF-8 sequence.
fn utf8_boundary(src: &[u8], max: usize) -> usize {
    if let Err(err) = std::str::from_utf8(&src[..max]) {
        if err.error_len().is_none() && err.valid_up_to() > 0 {
            return err.valid_up_to();
        }
    }
    max
}
