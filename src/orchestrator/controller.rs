//! Per-session controller actor.
//!
//! One controller task owns everything mutable about a live session: the
//! child process, the subscriber list, the prompt tails, and the sequence
//! counter. Callers reach it only through [`SessionCommand`]s, and readers
//! only through [`StreamEvent`]s, so state transitions are serialized
//! without a lock held across `.await`.
//!
//! The caller-visible [`Session`] record lives in [`SharedSession`]: a
//! `std::sync::Mutex` for the record plus a `watch` channel carrying the
//! state, so `wait` can block without polling.
//!
//! # Task layout
//!
//! ```text
//! stdout reader ─┐
//!                ├─ StreamEvent ─▶ controller ─▶ subscribers
//! stderr reader ─┘                    │
//!                                     └─ InputLine ─▶ stdin writer
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::history::{HistoryRecord, HistoryRecorder};
use crate::models::output::{EventFilter, OutputEvent, SessionEvent, StreamSource};
use crate::models::prompt::PromptRequest;
use crate::models::session::{Session, SessionHandle, SessionOutcome, SessionState, SpawnRequest};
use crate::orchestrator::idle_watchdog::{IdleWatchdog, IdleWatchdogHandle, WatchdogEvent};
use crate::orchestrator::spawner::{self, SpawnedProcess};
use crate::orchestrator::subscription::{Subscriber, SubscriptionId};
use crate::prompt::{Detection, PromptDetector};
use crate::stream::reader::{run_reader, StreamEvent};
use crate::stream::writer::{run_writer, InputLine};
use crate::{AppError, Result};

/// Capacity of the caller → controller command channel.
const COMMAND_BUFFER: usize = 32;

/// Requests a caller can make of a running session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Write one line to stdin. `force` skips the waiting-for-input check.
    SendInput {
        text: String,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Kill the process and finish the session as `Terminated`.
    Terminate { reply: oneshot::Sender<Result<()>> },
    /// Register an additional subscriber.
    Subscribe(Subscriber),
    /// Remove a subscriber.
    Unsubscribe(SubscriptionId),
}

/// Collaborators shared by every session of one manager.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) config: Arc<GlobalConfig>,
    pub(crate) detector: Arc<dyn PromptDetector>,
    pub(crate) history: Option<Arc<dyn HistoryRecorder>>,
}

/// Caller-visible session record plus its state broadcast.
#[derive(Debug)]
pub(crate) struct SharedSession {
    session: Mutex<Session>,
    state_tx: watch::Sender<SessionState>,
}

impl SharedSession {
    pub(crate) fn new(session: Session) -> Self {
        let (state_tx, _) = watch::channel(session.state);
        Self {
            session: Mutex::new(session),
            state_tx,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| AppError::Io("session record mutex poisoned".into()))?;
        Ok(f(&mut guard))
    }

    pub(crate) fn snapshot(&self) -> Result<Session> {
        self.update(|session| session.clone())
    }

    pub(crate) fn outcome(&self) -> Result<SessionOutcome> {
        self.update(|session| session.outcome())
    }

    /// Move to `next`, apply `extra` under the same lock, then publish.
    pub(crate) fn transition(
        &self,
        next: SessionState,
        extra: impl FnOnce(&mut Session),
    ) -> Result<()> {
        self.update(|session| {
            session.transition(next)?;
            extra(session);
            Ok::<(), AppError>(())
        })??;
        self.state_tx.send_replace(next);
        Ok(())
    }
}

/// Channels the manager keeps for a launched session.
pub(crate) struct LaunchedSession {
    pub(crate) shared: Arc<SharedSession>,
    pub(crate) commands: mpsc::Sender<SessionCommand>,
}

/// Not yet newline-terminated output on one stream.
#[derive(Debug, Default)]
struct HeldTail {
    text: String,
    /// Byte offset past the last answered prompt; only text after it is
    /// evaluated.
    answered_upto: usize,
}

impl HeldTail {
    fn unanswered(&self) -> Option<&str> {
        if self.text.len() <= self.answered_upto {
            return None;
        }
        Some(self.text.get(self.answered_upto..).unwrap_or(&self.text))
    }
}

/// Why the main loop stopped.
enum Ending {
    /// The process exited on its own and its output was drained.
    Exited {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// The session must be killed and finish in `state`.
    Killed {
        state: SessionState,
        reason: String,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

impl Ending {
    fn failed(err: &AppError) -> Self {
        Self::Killed {
            state: SessionState::Failed,
            reason: err.to_string(),
            reply: None,
        }
    }

    fn terminated(reason: impl Into<String>) -> Self {
        Self::Killed {
            state: SessionState::Terminated,
            reason: reason.into(),
            reply: None,
        }
    }
}

/// Outcome of a step that may end the session.
type Step = std::result::Result<(), Ending>;

/// Result of waiting for room in one subscriber's queue.
enum Slot {
    Ready(OwnedPermit<SessionEvent>),
    Closed,
    Stalled,
}

type Watchdog = (IdleWatchdogHandle, mpsc::Receiver<WatchdogEvent>);

/// The actor driving one session from spawn to its terminal state.
pub(crate) struct SessionController {
    handle: SessionHandle,
    request: SpawnRequest,
    ctx: SessionContext,
    shared: Arc<SharedSession>,
    child: Child,
    pid: Option<u32>,
    commands: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    /// Commands that arrived while an event delivery was blocked.
    deferred: VecDeque<SessionCommand>,
    stream_rx: mpsc::Receiver<StreamEvent>,
    input_tx: Option<mpsc::Sender<InputLine>>,
    subscribers: Vec<Subscriber>,
    last_sequence: u64,
    tails: HashMap<StreamSource, HeldTail>,
    last_partial: Option<StreamSource>,
    quiet_deadline: Option<Instant>,
    pending_request: Option<PromptRequest>,
    watchdog: Option<Watchdog>,
    io_cancel: CancellationToken,
    open_streams: usize,
    exit: Option<(Option<i32>, String)>,
    started_at: DateTime<Utc>,
}

impl SessionController {
    /// Wire up reader, writer and watchdog tasks for a freshly spawned
    /// process and start the controller.
    ///
    /// `initial` is registered before any output is read, so it observes
    /// every event of the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the session record cannot enter
    /// `Running`.
    pub(crate) fn launch(
        ctx: &SessionContext,
        handle: SessionHandle,
        request: SpawnRequest,
        process: SpawnedProcess,
        initial: Option<Subscriber>,
    ) -> Result<LaunchedSession> {
        let engine = &ctx.config.engine;
        let SpawnedProcess {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        } = process;

        let mut session = Session::new(handle, &request);
        session.pid = pid;
        session.transition(SessionState::Running)?;
        let shared = Arc::new(SharedSession::new(session));

        let io_cancel = CancellationToken::new();
        let (stream_tx, stream_rx) = mpsc::channel(engine.event_buffer);
        let (input_tx, input_rx) = mpsc::channel(engine.event_buffer);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        spawn_reader(
            handle,
            StreamSource::Stdout,
            stdout,
            engine.max_partial_line_bytes,
            stream_tx.clone(),
            io_cancel.clone(),
        );
        spawn_reader(
            handle,
            StreamSource::Stderr,
            stderr,
            engine.max_partial_line_bytes,
            stream_tx,
            io_cancel.clone(),
        );

        let writer_cancel = io_cancel.clone();
        tokio::spawn(
            async move {
                if let Err(err) = run_writer(handle, stdin, input_rx, writer_cancel).await {
                    debug!(%err, "writer stopped after a failed write");
                }
            }
            .instrument(info_span!("stdin_writer", %handle)),
        );

        let watchdog = ctx.config.timeouts.idle().map(|idle| {
            let (tx, rx) = mpsc::channel(1);
            let detector = IdleWatchdog::new(handle, idle, tx, io_cancel.child_token()).spawn();
            (detector, rx)
        });

        let controller = Self {
            handle,
            request,
            ctx: ctx.clone(),
            shared: Arc::clone(&shared),
            child,
            pid,
            commands: command_rx,
            commands_open: true,
            deferred: VecDeque::new(),
            stream_rx,
            input_tx: Some(input_tx),
            subscribers: initial.into_iter().collect(),
            last_sequence: 0,
            tails: HashMap::new(),
            last_partial: None,
            quiet_deadline: None,
            pending_request: None,
            watchdog,
            io_cancel,
            open_streams: 2,
            exit: None,
            started_at: Utc::now(),
        };

        tokio::spawn(controller.run().instrument(info_span!("session", %handle)));

        Ok(LaunchedSession {
            shared,
            commands: command_tx,
        })
    }

    async fn run(mut self) {
        info!(
            pid = self.pid.unwrap_or(0),
            command = %self.request.command_line(),
            "session started"
        );

        let runtime_deadline = self
            .ctx
            .config
            .timeouts
            .max_runtime()
            .map(|limit| Instant::now() + limit);
        let mut drain_deadline: Option<Instant> = None;

        let ending = loop {
            if self.exit.is_some() && self.open_streams == 0 {
                break Ending::Exited { reply: None };
            }
            if let Some(command) = self.deferred.pop_front() {
                if let Some(ending) = self.handle_command(command) {
                    break ending;
                }
                continue;
            }

            tokio::select! {
                biased;

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => {
                            if let Some(ending) = self.handle_command(command) {
                                break ending;
                            }
                        }
                        None => self.commands_open = false,
                    }
                }

                event = self.stream_rx.recv(), if self.open_streams > 0 => {
                    let Some(event) = event else {
                        self.open_streams = 0;
                        continue;
                    };
                    if let Err(ending) = self.handle_stream_event(event).await {
                        break ending;
                    }
                }

                status = self.child.wait(), if self.exit.is_none() => {
                    let exit = match status {
                        Ok(status) => spawner::describe_exit(status),
                        Err(err) => (None, format!("failed to wait for process: {err}")),
                    };
                    info!(exit_code = ?exit.0, "process exited");
                    self.exit = Some(exit);
                    drain_deadline = Some(Instant::now() + self.ctx.config.engine.drain_timeout());
                }

                () = sleep_until_opt(self.quiet_deadline) => {
                    self.quiet_deadline = None;
                    if let Err(ending) = self.evaluate_prompt().await {
                        break ending;
                    }
                }

                expired = next_watchdog_event(&mut self.watchdog) => {
                    let WatchdogEvent::Expired { idle, .. } = expired;
                    break Ending::terminated(format!(
                        "idle timeout: no output or input for {}s",
                        idle.as_secs()
                    ));
                }

                () = sleep_until_opt(runtime_deadline) => {
                    break Ending::terminated("maximum runtime exceeded");
                }

                () = sleep_until_opt(drain_deadline) => {
                    warn!(open_streams = self.open_streams, "output still open after exit");
                    break Ending::Exited { reply: None };
                }
            }
        };

        self.finish(ending).await;
    }

    fn handle_command(&mut self, command: SessionCommand) -> Option<Ending> {
        match command {
            SessionCommand::SendInput { text, force, reply } => {
                self.accept_input(text, force, reply);
                None
            }
            SessionCommand::Terminate { reply } => Some(self.terminate_ending(reply)),
            SessionCommand::Subscribe(subscriber) => {
                self.add_subscriber(subscriber);
                None
            }
            SessionCommand::Unsubscribe(id) => {
                self.subscribers.retain(|subscriber| subscriber.id != id);
                debug!(subscription = %id, "subscriber removed");
                None
            }
        }
    }

    fn terminate_ending(&self, reply: oneshot::Sender<Result<()>>) -> Ending {
        if self.exit.is_some() {
            debug!("terminate after exit; finishing as completed");
            return Ending::Exited { reply: Some(reply) };
        }
        info!("termination requested");
        Ending::Killed {
            state: SessionState::Terminated,
            reason: "terminated on request".into(),
            reply: Some(reply),
        }
    }

    fn accept_input(&mut self, text: String, force: bool, reply: oneshot::Sender<Result<()>>) {
        let state = self.shared.state();
        let allowed = if force {
            matches!(state, SessionState::Running | SessionState::WaitingForInput)
        } else {
            state == SessionState::WaitingForInput
        };
        if !allowed {
            let _ = reply.send(Err(AppError::InvalidState(format!(
                "session {} is {state}; input requires waiting_for_input",
                self.handle
            ))));
            return;
        }

        let Some(input_tx) = &self.input_tx else {
            let _ = reply.send(Err(AppError::InvalidState(format!(
                "session {}: stdin is closed",
                self.handle
            ))));
            return;
        };

        let (line, ack) = InputLine::new(text);
        if let Err(err) = input_tx.try_send(line) {
            let why = match err {
                TrySendError::Full(_) => "input queue is full",
                TrySendError::Closed(_) => "stdin is closed",
            };
            let _ = reply.send(Err(AppError::InvalidState(format!(
                "session {}: {why}",
                self.handle
            ))));
            return;
        }

        if state == SessionState::WaitingForInput {
            if let Err(err) = self.shared.transition(SessionState::Running, |_| {}) {
                warn!(%err, "failed to resume after input");
            }
            self.pending_request = None;
        }
        self.reset_watchdog();
        self.rearm_quiet_timer();
        debug!(forced = force, "input queued");

        tokio::spawn(async move {
            let result = match ack.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(AppError::InvalidState(format!("input not delivered: {err}"))),
                Err(_) => Err(AppError::InvalidState(
                    "input not delivered: stdin closed".into(),
                )),
            };
            let _ = reply.send(result);
        });
    }

    fn add_subscriber(&mut self, subscriber: Subscriber) {
        // A late prompt subscriber still learns the session is blocked.
        if let Some(request) = &self.pending_request {
            if matches!(subscriber.filter, EventFilter::All | EventFilter::Prompts)
                && subscriber
                    .tx
                    .try_send(SessionEvent::Prompt(request.clone()))
                    .is_err()
            {
                debug!(subscription = %subscriber.id, "pending prompt not delivered");
            }
        }
        debug!(subscription = %subscriber.id, "subscriber attached");
        self.subscribers.push(subscriber);
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) -> Step {
        match event {
            StreamEvent::Lines { source, text } => {
                self.tails.remove(&source);
                self.reset_watchdog();
                self.capture(source, &text).map_err(|err| Ending::failed(&err))?;
                self.last_sequence += 1;
                let output = OutputEvent {
                    handle: self.handle,
                    source,
                    text,
                    sequence: self.last_sequence,
                };
                self.deliver(SessionEvent::Output(output)).await?;
            }
            StreamEvent::Partial { source, tail } => {
                self.reset_watchdog();
                self.tails.entry(source).or_default().text = tail;
                self.last_partial = Some(source);
            }
            StreamEvent::Closed { source, error } => {
                self.open_streams = self.open_streams.saturating_sub(1);
                match error {
                    Some(err) => warn!(?source, %err, "output stream failed"),
                    None => debug!(?source, "output stream closed"),
                }
            }
        }

        if self.ctx.config.prompt.quiet_period().is_zero() {
            self.quiet_deadline = None;
            return self.evaluate_prompt().await;
        }
        self.rearm_quiet_timer();
        Ok(())
    }

    /// Restart the quiet period if an unanswered tail could be a prompt.
    fn rearm_quiet_timer(&mut self) {
        let pending = self.shared.state() == SessionState::Running
            && self.tails.values().any(|tail| tail.unanswered().is_some());
        self.quiet_deadline =
            pending.then(|| Instant::now() + self.ctx.config.prompt.quiet_period());
    }

    /// Append output to the session record, enforcing `max_capture_bytes`.
    fn capture(&self, source: StreamSource, text: &str) -> Result<()> {
        let limit = self.ctx.config.engine.max_capture_bytes;
        let fits = self.shared.update(|session| {
            if session.captured_bytes() + text.len() > limit {
                return false;
            }
            match source {
                StreamSource::Stdout => session.stdout.push_str(text),
                StreamSource::Stderr => session.stderr.push_str(text),
            }
            session.updated_at = Utc::now();
            true
        })?;

        if fits {
            Ok(())
        } else {
            Err(AppError::BufferOverflow(format!(
                "captured output exceeded {limit} bytes"
            )))
        }
    }

    async fn evaluate_prompt(&mut self) -> Step {
        if self.shared.state() != SessionState::Running {
            return Ok(());
        }

        let order = match self.last_partial {
            Some(StreamSource::Stderr) => [StreamSource::Stderr, StreamSource::Stdout],
            _ => [StreamSource::Stdout, StreamSource::Stderr],
        };

        for source in order {
            let Some(tail) = self.tails.get_mut(&source) else {
                continue;
            };
            let Some(fresh) = tail.unanswered() else {
                continue;
            };
            if let Detection::Prompt(prompt_text) = self.ctx.detector.evaluate(fresh) {
                tail.answered_upto = tail.text.len();
                return self.enter_waiting(source, prompt_text).await;
            }
        }
        Ok(())
    }

    async fn enter_waiting(&mut self, source: StreamSource, prompt_text: String) -> Step {
        let pending = prompt_text.clone();
        self.shared
            .transition(SessionState::WaitingForInput, |session| {
                session.pending_prompt = Some(pending);
            })
            .map_err(|err| Ending::failed(&err))?;
        self.quiet_deadline = None;

        let request = PromptRequest {
            handle: self.handle,
            prompt_text,
            source,
            after_sequence: self.last_sequence,
        };
        info!(prompt = %request.prompt_text, ?source, "waiting for input");
        self.pending_request = Some(request.clone());
        self.deliver(SessionEvent::Prompt(request)).await
    }

    /// Deliver `event` to every interested subscriber in registration order.
    ///
    /// Subscribers whose receiver is gone are pruned. A subscriber that stays
    /// full for `subscriber_stall_timeout_ms` overflows the session. While a
    /// delivery waits, `Terminate` ends the session at once and other
    /// commands are deferred until the delivery completes.
    async fn deliver(&mut self, event: SessionEvent) -> Step {
        let timeout = self.ctx.config.engine.subscriber_stall_timeout();
        let mut index = 0;

        while index < self.subscribers.len() {
            let subscriber = &self.subscribers[index];
            let id = subscriber.id;
            if !subscriber.filter.accepts(&event) {
                index += 1;
                continue;
            }

            let tx = subscriber.tx.clone();
            match self.wait_for_slot(tx, timeout).await? {
                Slot::Ready(permit) => {
                    permit.send(event.clone());
                    index += 1;
                }
                Slot::Closed => {
                    debug!(subscription = %id, "subscriber detached");
                    self.subscribers.remove(index);
                }
                Slot::Stalled => {
                    self.subscribers.remove(index);
                    let err = AppError::BufferOverflow(format!(
                        "subscriber {id} refused events for {}ms",
                        timeout.as_millis()
                    ));
                    return Err(Ending::failed(&err));
                }
            }
        }
        Ok(())
    }

    async fn wait_for_slot(
        &mut self,
        tx: mpsc::Sender<SessionEvent>,
        timeout: Duration,
    ) -> std::result::Result<Slot, Ending> {
        let reserve = tx.reserve_owned();
        let stall = tokio::time::sleep(timeout);
        tokio::pin!(reserve, stall);

        loop {
            tokio::select! {
                biased;

                permit = &mut reserve => {
                    return Ok(permit.map_or(Slot::Closed, Slot::Ready));
                }

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(SessionCommand::Terminate { reply }) => {
                            debug!("terminate preempts a blocked delivery");
                            return Err(self.terminate_ending(reply));
                        }
                        Some(command) => self.deferred.push_back(command),
                        None => self.commands_open = false,
                    }
                }

                () = &mut stall => return Ok(Slot::Stalled),
            }
        }
    }

    /// Best-effort delivery of a closing event. A subscriber still full
    /// after the stall timeout is dropped.
    async fn deliver_final(&mut self, event: SessionEvent) {
        let timeout = self.ctx.config.engine.subscriber_stall_timeout();
        let mut kept = Vec::with_capacity(self.subscribers.len());

        for subscriber in std::mem::take(&mut self.subscribers) {
            if !subscriber.filter.accepts(&event) {
                kept.push(subscriber);
                continue;
            }
            match subscriber.tx.send_timeout(event.clone(), timeout).await {
                Ok(()) => kept.push(subscriber),
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(subscription = %subscriber.id, "subscriber detached");
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(subscription = %subscriber.id, "dropping stalled subscriber");
                }
            }
        }
        self.subscribers = kept;
    }

    fn reset_watchdog(&self) {
        if let Some((watchdog, _)) = &self.watchdog {
            watchdog.reset();
        }
    }

    /// Kill the process tree and reap the child within the grace period.
    async fn kill_process(&mut self) {
        spawner::kill_process_tree(
            &mut self.child,
            self.pid,
            self.ctx.config.engine.kill_process_group,
        );
        if self.exit.is_some() {
            return;
        }

        let grace = self.ctx.config.engine.terminate_grace();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => self.exit = Some(spawner::describe_exit(status)),
            Ok(Err(err)) => warn!(%err, "failed to reap killed process"),
            Err(_) => warn!(?grace, "process still alive after grace period"),
        }
    }

    async fn finish(mut self, ending: Ending) {
        self.quiet_deadline = None;
        self.watchdog = None;

        let (state, reason, reply) = match ending {
            Ending::Exited { reply } => {
                if self.open_streams > 0 {
                    // Descendants still hold the pipes open.
                    self.kill_process().await;
                }
                let reason = self
                    .exit
                    .as_ref()
                    .map_or_else(|| "process exited".to_owned(), |(_, reason)| reason.clone());
                (SessionState::Completed, reason, reply)
            }
            Ending::Killed {
                state,
                reason,
                reply,
            } => {
                self.kill_process().await;
                (state, reason, reply)
            }
        };

        self.io_cancel.cancel();
        self.input_tx = None;

        let exit_code = self.exit.as_ref().and_then(|(code, _)| *code);
        let terminal_reason = reason.clone();
        if let Err(err) = self.shared.transition(state, |session| {
            session.exit_code = exit_code;
            session.reason = Some(terminal_reason);
        }) {
            warn!(%err, "failed to record terminal state");
        }
        info!(%state, ?exit_code, reason = %reason, "session finished");

        let outcome = self.shared.outcome().unwrap_or_else(|err| {
            warn!(%err, "session record unavailable; reporting empty outcome");
            SessionOutcome {
                handle: self.handle,
                state,
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
                reason: Some(reason),
            }
        });

        // Callers waiting on terminate never wait on a slow subscriber.
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        self.drain_commands(&outcome);

        self.deliver_final(SessionEvent::Finished(outcome.clone())).await;
        self.record_history(&outcome).await;
    }

    async fn record_history(&mut self, outcome: &SessionOutcome) {
        let Some(recorder) = self.ctx.history.clone() else {
            return;
        };
        let record = HistoryRecord::from_outcome(&self.request, outcome, self.started_at);

        let result = match tokio::task::spawn_blocking(move || recorder.record(record)).await {
            Ok(result) => result,
            Err(err) => Err(AppError::HistoryWrite(format!("history task failed: {err}"))),
        };

        match result {
            Ok(()) => debug!("history recorded"),
            Err(err) => {
                warn!(%err, "failed to record history");
                let warning = SessionEvent::Warning {
                    handle: self.handle,
                    message: err.to_string(),
                };
                self.deliver_final(warning).await;
            }
        }
    }

    /// Answer commands that raced with the session finishing.
    fn drain_commands(&mut self, outcome: &SessionOutcome) {
        self.commands.close();
        let mut pending: Vec<SessionCommand> = self.deferred.drain(..).collect();
        while let Ok(command) = self.commands.try_recv() {
            pending.push(command);
        }

        for command in pending {
            match command {
                SessionCommand::SendInput { reply, .. } => {
                    let _ = reply.send(Err(AppError::InvalidState(format!(
                        "session {} is {}",
                        self.handle, outcome.state
                    ))));
                }
                SessionCommand::Terminate { reply } => {
                    let _ = reply.send(Ok(()));
                }
                SessionCommand::Subscribe(subscriber) => {
                    let _ = subscriber
                        .tx
                        .try_send(SessionEvent::Finished(outcome.clone()));
                }
                SessionCommand::Unsubscribe(id) => {
                    self.subscribers.retain(|subscriber| subscriber.id != id);
                }
            }
        }
    }
}

fn spawn_reader<R>(
    handle: SessionHandle,
    source: StreamSource,
    stream: R,
    max_partial_bytes: usize,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(err) =
                run_reader(handle, source, stream, max_partial_bytes, event_tx, cancel).await
            {
                warn!(%err, "reader task failed");
            }
        }
        .instrument(info_span!("reader", %handle, source = ?source)),
    );
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_watchdog_event(watchdog: &mut Option<Watchdog>) -> WatchdogEvent {
    match watchdog {
        Some((_, rx)) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
