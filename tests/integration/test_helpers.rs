//! Shared helpers for integration tests.

use std::path::Path;
use std::time::Duration;

use command_assist::models::output::SessionEvent;
use command_assist::models::session::{SessionOutcome, SpawnRequest};
use command_assist::orchestrator::Subscription;
use command_assist::GlobalConfig;

/// Upper bound for any single wait in these tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration tuned for fast tests: short quiet period, no history.
pub fn test_config(history_dir: &Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.history_dir = history_dir.to_owned();
    config.record_history = false;
    config.prompt.quiet_period_ms = 50;
    config.engine.terminate_grace_ms = 2_000;
    config.engine.drain_timeout_ms = 1_000;
    config
}

/// `sh -c <script>` in `dir`.
pub fn sh(dir: &Path, script: &str) -> SpawnRequest {
    SpawnRequest::new("sh", dir).with_args(["-c", script])
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, sub.recv())
        .await
        .expect("event should arrive before timeout")
        .expect("subscription closed unexpectedly")
}

/// Read events until `Finished`, returning everything before it and the
/// outcome.
pub async fn collect_until_finished(sub: &mut Subscription) -> (Vec<SessionEvent>, SessionOutcome) {
    let mut events = Vec::new();
    loop {
        match next_event(sub).await {
            SessionEvent::Finished(outcome) => return (events, outcome),
            other => events.push(other),
        }
    }
}

/// Concatenated output text of every `Output` event in `events`.
pub fn output_text(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Output(output) => Some(output.text.as_str()),
            _ => None,
        })
        .collect()
}

/// Whether `pid` no longer names a live process (gone or zombie).
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

/// Poll `check` until it holds or `STEP_TIMEOUT` passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
