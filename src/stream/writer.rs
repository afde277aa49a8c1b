//! Stdin writer task.
//!
//! Owns the child's stdin. Input lines arrive over a tokio [`mpsc`] channel
//! and are written strictly one after another, so bytes from two callers can
//! never interleave. Each line is terminated by `\n` and flushed before the
//! next one is taken.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::session::SessionHandle;
use crate::{AppError, Result};

/// One line of caller input queued for the child.
#[derive(Debug)]
pub struct InputLine {
    /// Text to write; a trailing `\n` is appended by the writer.
    pub text: String,
    /// Completion signal for the caller.
    pub ack: Option<oneshot::Sender<Result<()>>>,
}

impl InputLine {
    /// Queue `text` with a completion signal.
    #[must_use]
    pub fn new(text: String) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                text,
                ack: Some(tx),
            },
            rx,
        )
    }
}

/// Writer task: writes each queued [`InputLine`] to `stdin`.
///
/// The task exits cleanly when:
/// - `cancel` is triggered, or
/// - `input_rx` is closed (all senders dropped); stdin is then closed so the
///   child sees EOF.
///
/// # Errors
///
/// Returns [`AppError::WriteFailure`] if a write or flush fails (typically
/// because the child already exited). The failing line's `ack` receives the
/// same error; lines still queued are dropped and their callers observe a
/// closed channel.
pub async fn run_writer<W>(
    handle: SessionHandle,
    mut stdin: W,
    mut input_rx: mpsc::Receiver<InputLine>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let line = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%handle, "writer: cancellation received, stopping");
                return Ok(());
            }

            line = input_rx.recv() => line,
        };

        let Some(mut line) = line else {
            debug!(%handle, "writer: input channel closed, closing stdin");
            if let Err(err) = stdin.shutdown().await {
                debug!(%handle, %err, "writer: stdin shutdown failed");
            }
            return Ok(());
        };

        let mut bytes = std::mem::take(&mut line.text).into_bytes();
        bytes.push(b'\n');

        let written = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };

        match written {
            Ok(()) => {
                debug!(%handle, bytes = bytes.len(), "writer: input delivered");
                if let Some(ack) = line.ack.take() {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                warn!(%handle, error = %err, "writer: write to stdin failed");
                let message = format!("stdin write failed: {err}");
                if let Some(ack) = line.ack.take() {
                    let _ = ack.send(Err(AppError::WriteFailure(message.clone())));
                }
                return Err(AppError::WriteFailure(message));
            }
        }
    }
}
