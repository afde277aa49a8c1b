//! Per-session idle watchdog.
//!
//! Each session with a nonzero `timeouts.idle_seconds` gets an
//! [`IdleWatchdog`] that fires once the session has seen neither output nor
//! caller input for the configured threshold. The controller calls
//! [`reset`](IdleWatchdogHandle::reset) on every chunk of output and every
//! accepted input line.
//!
//! Expiry is delivered over a `tokio::sync::mpsc` channel; the controller
//! reacts by terminating the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::models::session::SessionHandle;

/// Events emitted by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// The session has been idle past the threshold.
    Expired {
        /// Session that went idle.
        handle: SessionHandle,
        /// Threshold that elapsed.
        idle: Duration,
    },
}

/// Builder for a per-session idle watchdog.
///
/// Call [`spawn`](Self::spawn) to start the background timer task.
pub struct IdleWatchdog {
    handle: SessionHandle,
    threshold: Duration,
    event_tx: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl IdleWatchdog {
    /// Construct a watchdog (does not start the timer yet).
    #[must_use]
    pub fn new(
        handle: SessionHandle,
        threshold: Duration,
        event_tx: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle,
            threshold,
            event_tx,
            cancel,
        }
    }

    /// Spawn the background timer task and return a handle for controlling it.
    #[must_use]
    pub fn spawn(self) -> IdleWatchdogHandle {
        let reset_notify = Arc::new(Notify::new());
        let cancel_for_handle = self.cancel.clone();

        tokio::spawn(
            Self::run(
                self.handle,
                self.threshold,
                self.event_tx,
                self.cancel,
                Arc::clone(&reset_notify),
            )
            .instrument(info_span!("idle_watchdog", handle = %self.handle)),
        );

        IdleWatchdogHandle {
            reset_notify,
            cancel: cancel_for_handle,
        }
    }

    async fn run(
        handle: SessionHandle,
        threshold: Duration,
        event_tx: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
        reset_notify: Arc<Notify>,
    ) {
        loop {
            let fired = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("idle watchdog cancelled");
                    return;
                }
                () = tokio::time::sleep(threshold) => true,
                () = reset_notify.notified() => false,
            };

            if !fired {
                continue;
            }

            info!(idle_secs = threshold.as_secs(), "session idle past threshold");
            if event_tx
                .send(WatchdogEvent::Expired {
                    handle,
                    idle: threshold,
                })
                .await
                .is_err()
            {
                return;
            }

            // Fire once per idle period: wait for activity before re-arming.
            tokio::select! {
                () = cancel.cancelled() => return,
                () = reset_notify.notified() => {}
            }
        }
    }
}

/// Handle returned from [`IdleWatchdog::spawn`]. Dropping it stops the timer.
pub struct IdleWatchdogHandle {
    reset_notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Drop for IdleWatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl IdleWatchdogHandle {
    /// Restart the idle timer.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }
}
