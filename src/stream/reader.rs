//! Output stream reader task.
//!
//! Reads one child output stream (stdout or stderr) through
//! [`FramedRead`] backed by [`OutputCodec`], and forwards each frame to the
//! session controller as a [`StreamEvent`] over a bounded tokio [`mpsc`]
//! channel.
//!
//! The reader never drops data: when the controller is slow the `send`
//! awaits, which in turn back-pressures the child through its pipe. The
//! controller bounds that wait (see `subscriber_stall_timeout_ms`) and kills
//! the session with `BufferOverflow` rather than let the child block forever.
//!
//! # Frame mapping
//!
//! | Frame               | Event                        |
//! |---------------------|------------------------------|
//! | `Frame::Lines`      | [`StreamEvent::Lines`]       |
//! | `Frame::Partial`    | [`StreamEvent::Partial`]     |
//! | EOF                 | [`StreamEvent::Closed`]      |
//! | I/O error           | [`StreamEvent::Closed`] with `error` set |

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::output::StreamSource;
use crate::models::session::SessionHandle;
use crate::stream::codec::{Frame, OutputCodec};
use crate::Result;

/// Event forwarded from a reader task to its session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Complete lines (or the final partial line at close).
    Lines {
        /// Originating stream.
        source: StreamSource,
        /// Text including newlines.
        text: String,
    },
    /// The held, not yet newline-terminated tail grew.
    Partial {
        /// Originating stream.
        source: StreamSource,
        /// Entire held tail.
        tail: String,
    },
    /// The stream closed; no further events follow for `source`.
    Closed {
        /// Originating stream.
        source: StreamSource,
        /// I/O error that ended the stream, if any.
        error: Option<String>,
    },
}

/// Frame a raw output stream into a lazy sequence of [`Frame`]s.
///
/// The sequence ends when the underlying stream closes.
pub fn attach<R>(stream: R, max_partial_bytes: usize) -> FramedRead<R, OutputCodec>
where
    R: AsyncRead,
{
    FramedRead::new(stream, OutputCodec::new(max_partial_bytes))
}

/// Reader task: frames `stream` and emits [`StreamEvent`]s until EOF.
///
/// Always finishes with exactly one [`StreamEvent::Closed`] unless cancelled
/// or the controller went away.
///
/// # Cancellation
///
/// When `cancel` fires the reader exits without emitting `Closed`.
///
/// # Errors
///
/// Returns `Ok(())` on EOF, I/O failure (reported through `Closed`),
/// cancellation, or a closed event channel.
pub async fn run_reader<R>(
    handle: SessionHandle,
    source: StreamSource,
    stream: R,
    max_partial_bytes: usize,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = attach(stream, max_partial_bytes);

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%handle, ?source, "reader: cancellation received, stopping");
                return Ok(());
            }

            item = framed.next() => item,
        };

        let event = match item {
            None => {
                debug!(%handle, ?source, "reader: EOF detected");
                send_closed(&event_tx, handle, source, None).await;
                return Ok(());
            }
            Some(Err(err)) => {
                warn!(%handle, ?source, error = %err, "reader: IO error, stopping");
                send_closed(&event_tx, handle, source, Some(err.to_string())).await;
                return Ok(());
            }
            Some(Ok(Frame::Lines(text))) => StreamEvent::Lines { source, text },
            Some(Ok(Frame::Partial(tail))) => StreamEvent::Partial { source, tail },
        };

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            sent = event_tx.send(event) => sent,
        };

        if sent.is_err() {
            debug!(%handle, ?source, "reader: event_tx closed, stopping");
            return Ok(());
        }
    }
}

/// Send [`StreamEvent::Closed`], logging if the controller is gone.
async fn send_closed(
    event_tx: &mpsc::Sender<StreamEvent>,
    handle: SessionHandle,
    source: StreamSource,
    error: Option<String>,
) {
    if event_tx
        .send(StreamEvent::Closed { source, error })
        .await
        .is_err()
    {
        debug!(
            %handle,
            ?source,
            "reader: event_tx closed before Closed could be delivered"
        );
    }
}
