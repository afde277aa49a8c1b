//! Session registry and caller-facing operations.
//!
//! [`SessionManager`] is the single entry point for starting, steering,
//! observing, and terminating sessions. It is cheaply cloneable; all clones
//! share one registry. Each session is driven by its own controller task
//! (see `controller`), which the manager reaches through a command channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::history::{HistoryOutcome, HistoryRecord, HistoryRecorder, JsonlHistoryWriter};
use crate::models::output::{EventFilter, SessionEvent};
use crate::models::session::{Session, SessionHandle, SessionOutcome, SessionState, SpawnRequest};
use crate::orchestrator::controller::{
    SessionCommand, SessionContext, SessionController, SharedSession,
};
use crate::orchestrator::spawner;
use crate::orchestrator::subscription::{Subscriber, Subscription, SubscriptionId};
use crate::prompt::{PatternPromptDetector, PromptDetector};
use crate::{AppError, Result};

/// Registry entry for one session.
#[derive(Clone)]
struct SessionEntry {
    shared: Arc<SharedSession>,
    commands: mpsc::Sender<SessionCommand>,
    channel: Option<String>,
}

/// Owns every session started by this engine.
#[derive(Clone)]
pub struct SessionManager {
    ctx: SessionContext,
    sessions: Arc<Mutex<HashMap<SessionHandle, SessionEntry>>>,
    next_subscription: Arc<AtomicU64>,
}

impl SessionManager {
    /// Build a manager from configuration, with the regex prompt detector
    /// and, when `record_history` is set, the JSONL history writer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails, a prompt pattern does
    /// not compile, or the history directory cannot be created.
    pub fn new(config: GlobalConfig) -> Result<Self> {
        config.validate()?;
        let detector = PatternPromptDetector::from_config(&config.prompt)?;
        let history: Option<Arc<dyn HistoryRecorder>> = if config.record_history {
            Some(Arc::new(JsonlHistoryWriter::new(config.history_dir.clone())?))
        } else {
            None
        };
        Ok(Self::with_components(config, Arc::new(detector), history))
    }

    /// Build a manager with explicit collaborators.
    #[must_use]
    pub fn with_components(
        config: GlobalConfig,
        detector: Arc<dyn PromptDetector>,
        history: Option<Arc<dyn HistoryRecorder>>,
    ) -> Self {
        Self {
            ctx: SessionContext {
                config: Arc::new(config),
                detector,
                history,
            },
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Configuration every session runs with.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.ctx.config
    }

    /// Launch a session and return its handle once the process is running.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the process cannot be launched (the failure is
    ///   still recorded to history).
    /// - `AppError::InvalidState` if the request's channel already has an
    ///   active session.
    pub async fn start(&self, request: SpawnRequest) -> Result<SessionHandle> {
        let handle = SessionHandle::new();
        self.launch(handle, request, None).await?;
        Ok(handle)
    }

    /// Launch a session with a subscription registered before the first
    /// byte of output is read, so no event can be missed.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn start_subscribed(
        &self,
        request: SpawnRequest,
        filter: EventFilter,
    ) -> Result<(SessionHandle, Subscription)> {
        let handle = SessionHandle::new();
        let (subscriber, subscription) = self.new_subscription(handle, filter);
        self.launch(handle, request, Some(subscriber)).await?;
        Ok((handle, subscription))
    }

    async fn launch(
        &self,
        handle: SessionHandle,
        request: SpawnRequest,
        initial: Option<Subscriber>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;

        if let Some(channel) = request.channel.as_deref() {
            let active = sessions.iter().find(|(_, entry)| {
                entry.channel.as_deref() == Some(channel) && entry.shared.state().is_active()
            });
            if let Some((active, _)) = active {
                return Err(AppError::InvalidState(format!(
                    "channel {channel} already has active session {active}"
                )));
            }
            // Finished sessions on this channel are released.
            sessions.retain(|_, entry| entry.channel.as_deref() != Some(channel));
        }

        let process = match spawner::spawn_process(&request, &self.ctx.config.engine, handle) {
            Ok(process) => process,
            Err(err) => {
                drop(sessions);
                warn!(command = %request.command_line(), %err, "spawn failed");
                self.record_spawn_failure(&request, &err).await;
                return Err(err);
            }
        };

        let channel = request.channel.clone();
        let launched = SessionController::launch(&self.ctx, handle, request, process, initial)?;
        sessions.insert(
            handle,
            SessionEntry {
                shared: launched.shared,
                commands: launched.commands,
                channel,
            },
        );
        info!(%handle, "session registered");
        Ok(())
    }

    async fn record_spawn_failure(&self, request: &SpawnRequest, err: &AppError) {
        let Some(recorder) = self.ctx.history.clone() else {
            return;
        };
        let record = HistoryRecord::new(request, HistoryOutcome::Failed, err.to_string());
        match tokio::task::spawn_blocking(move || recorder.record(record)).await {
            Ok(Ok(())) => debug!("spawn failure recorded"),
            Ok(Err(err)) => warn!(%err, "failed to record spawn failure"),
            Err(err) => warn!(%err, "history task failed"),
        }
    }

    /// Answer a pending prompt with one line of input.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown handle.
    /// - `AppError::InvalidState` unless the session is `WaitingForInput`,
    ///   or if the line could not be written to the child's stdin.
    pub async fn send_input(&self, handle: SessionHandle, text: impl Into<String>) -> Result<()> {
        self.input(handle, text.into(), false).await
    }

    /// Write one line of input whether or not a prompt was detected.
    ///
    /// Escape hatch for prompts the detector does not recognize. Accepted in
    /// `Running` and `WaitingForInput`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown handle.
    /// - `AppError::InvalidState` if the session is terminal or the write
    ///   fails.
    pub async fn send_anyway(&self, handle: SessionHandle, text: impl Into<String>) -> Result<()> {
        self.input(handle, text.into(), true).await
    }

    async fn input(&self, handle: SessionHandle, text: String, force: bool) -> Result<()> {
        let entry = self.entry(handle).await?;
        let (reply, rx) = oneshot::channel();
        let command = SessionCommand::SendInput { text, force, reply };

        if entry.commands.send(command).await.is_err() {
            return Err(AppError::InvalidState(format!(
                "session {handle} is {}",
                entry.shared.state()
            )));
        }
        rx.await.map_err(|_| {
            AppError::InvalidState(format!("session {handle} ended before accepting input"))
        })?
    }

    /// Kill the session's process tree and finish it as `Terminated`.
    ///
    /// Returns once the process has been killed and the terminal state is
    /// recorded. Idempotent: terminating a finished session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn terminate(&self, handle: SessionHandle) -> Result<()> {
        let entry = self.entry(handle).await?;
        if entry.shared.state().is_terminal() {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        if entry
            .commands
            .send(SessionCommand::Terminate { reply })
            .await
            .is_err()
        {
            debug!(%handle, "controller already gone");
            return Ok(());
        }
        // A dropped reply means the controller finished on its own meanwhile.
        rx.await.unwrap_or(Ok(()))
    }

    /// Observe a session's events from now on.
    ///
    /// Subscribing to a finished session yields only its `Finished` event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn subscribe(
        &self,
        handle: SessionHandle,
        filter: EventFilter,
    ) -> Result<Subscription> {
        let entry = self.entry(handle).await?;
        let (subscriber, subscription) = self.new_subscription(handle, filter);
        let tx = subscriber.tx.clone();

        let registered = entry.shared.state().is_active()
            && entry
                .commands
                .send(SessionCommand::Subscribe(subscriber))
                .await
                .is_ok();
        if !registered {
            let outcome = entry.shared.outcome()?;
            let _ = tx.try_send(SessionEvent::Finished(outcome));
        }
        Ok(subscription)
    }

    /// Stop delivering events to subscription `id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn unsubscribe(&self, handle: SessionHandle, id: SubscriptionId) -> Result<()> {
        let entry = self.entry(handle).await?;
        if entry
            .commands
            .send(SessionCommand::Unsubscribe(id))
            .await
            .is_err()
        {
            debug!(%handle, subscription = %id, "session finished; nothing to unsubscribe");
        }
        Ok(())
    }

    fn new_subscription(
        &self,
        handle: SessionHandle,
        filter: EventFilter,
    ) -> (Subscriber, Subscription) {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.ctx.config.engine.event_buffer);
        (
            Subscriber { id, filter, tx },
            Subscription::new(id, handle, rx),
        )
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn state(&self, handle: SessionHandle) -> Result<SessionState> {
        Ok(self.entry(handle).await?.shared.state())
    }

    /// Point-in-time copy of the session record, including captured output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn snapshot(&self, handle: SessionHandle) -> Result<Session> {
        self.entry(handle).await?.shared.snapshot()
    }

    /// Wait until the session is terminal and return its outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub async fn wait(&self, handle: SessionHandle) -> Result<SessionOutcome> {
        let entry = self.entry(handle).await?;
        let mut state_rx = entry.shared.watch_state();
        if state_rx.wait_for(|state| state.is_terminal()).await.is_err() {
            debug!(%handle, "state channel closed while waiting");
        }
        entry.shared.outcome()
    }

    /// Release a finished session from the registry.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown handle.
    /// - `AppError::InvalidState` if the session is still active.
    pub async fn acknowledge(&self, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get(&handle)
            .ok_or_else(|| AppError::NotFound(format!("session {handle} not found")))?;
        let state = entry.shared.state();
        if state.is_active() {
            return Err(AppError::InvalidState(format!(
                "session {handle} is {state}; terminate it first"
            )));
        }
        sessions.remove(&handle);
        debug!(%handle, "session released");
        Ok(())
    }

    /// Snapshots of every registered session, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let entries: Vec<SessionEntry> = self.sessions.lock().await.values().cloned().collect();
        let mut snapshots: Vec<Session> = entries
            .iter()
            .filter_map(|entry| entry.shared.snapshot().ok())
            .collect();
        snapshots.sort_by_key(|session| session.created_at);
        snapshots
    }

    /// Active session bound to `channel`, if any.
    pub async fn active_on_channel(&self, channel: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|(_, entry)| {
                entry.channel.as_deref() == Some(channel) && entry.shared.state().is_active()
            })
            .map(|(handle, _)| *handle)
    }

    /// Terminate every active session.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.shared.state().is_active())
            .map(|(handle, _)| *handle)
            .collect();

        info!(count = handles.len(), "shutting down active sessions");
        for handle in handles {
            if let Err(err) = self.terminate(handle).await {
                warn!(%handle, %err, "failed to terminate session during shutdown");
            }
        }
    }

    async fn entry(&self, handle: SessionHandle) -> Result<SessionEntry> {
        self.sessions
            .lock()
            .await
            .get(&handle)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {handle} not found")))
    }
}
