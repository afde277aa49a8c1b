//! Integration tests for prompt detection and answering.

use std::sync::Arc;
use std::time::Duration;

use command_assist::models::output::{EventFilter, SessionEvent, StreamSource};
use command_assist::models::session::SessionState;
use command_assist::prompt::{Detection, PromptDetector};
use command_assist::{AppError, SessionManager};

use super::test_helpers::{collect_until_finished, next_event, output_text, sh, test_config};

#[tokio::test]
async fn blocking_prompt_raises_exactly_one_request() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "printf 'Enter name: '; read name; echo \"Hello $name\""),
            EventFilter::All,
        )
        .await
        .expect("start");

    let SessionEvent::Prompt(prompt) = next_event(&mut sub).await else {
        panic!("first event must be the prompt");
    };
    assert_eq!(prompt.prompt_text, "Enter name:");
    assert_eq!(prompt.handle, handle);
    assert_eq!(prompt.source, StreamSource::Stdout);
    assert_eq!(prompt.after_sequence, 0);

    // Still blocked, and no duplicate request.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sub.try_recv().is_none(), "prompt must be raised once");
    assert_eq!(
        manager.state(handle).await.expect("state"),
        SessionState::WaitingForInput
    );
    let snapshot = manager.snapshot(handle).await.expect("snapshot");
    assert_eq!(snapshot.pending_prompt.as_deref(), Some("Enter name:"));

    manager.send_input(handle, "bob").await.expect("answer");
    assert_ne!(
        manager.state(handle).await.expect("state"),
        SessionState::WaitingForInput
    );

    let (events, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(output_text(&events), "Enter name: Hello bob\n");
    assert_eq!(outcome.stdout, "Enter name: Hello bob\n");
}

#[tokio::test]
async fn send_input_outside_waiting_is_invalid_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "echo working; sleep 1; printf 'Proceed? '; read x; echo done"),
            EventFilter::All,
        )
        .await
        .expect("start");

    // Running: rejected.
    let err = manager.send_input(handle, "early").await.expect_err("running");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");

    loop {
        if let SessionEvent::Prompt(_) = next_event(&mut sub).await {
            break;
        }
    }

    manager.send_input(handle, "y").await.expect("answer");
    // Second answer to the same prompt: rejected.
    let err = manager.send_input(handle, "again").await.expect_err("answered");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");

    let (_, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(outcome.state, SessionState::Completed);

    // Terminal: rejected, including the escape hatch.
    assert!(matches!(
        manager.send_input(handle, "late").await,
        Err(AppError::InvalidState(_))
    ));
    assert!(matches!(
        manager.send_anyway(handle, "late").await,
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test]
async fn concurrent_answers_deliver_exactly_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "printf 'Name: '; read n; echo \"hi $n\""),
            EventFilter::All,
        )
        .await
        .expect("start");
    assert!(matches!(next_event(&mut sub).await, SessionEvent::Prompt(_)));

    let (a, b) = tokio::join!(
        manager.send_input(handle, "x"),
        manager.send_input(handle, "y")
    );
    assert!(a.is_ok() != b.is_ok(), "exactly one answer lands: {a:?} {b:?}");
    let rejected = if a.is_ok() { b } else { a };
    assert!(
        matches!(rejected, Err(AppError::InvalidState(_))),
        "got {rejected:?}"
    );

    let (_, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(outcome.state, SessionState::Completed);
    assert!(
        outcome.stdout == "Name: hi x\n" || outcome.stdout == "Name: hi y\n",
        "got {:?}",
        outcome.stdout
    );
}

#[tokio::test]
async fn answer_to_closed_stdin_is_invalid_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "exec 0<&-; printf 'Name: '; sleep 1"),
            EventFilter::All,
        )
        .await
        .expect("start");
    assert!(matches!(next_event(&mut sub).await, SessionEvent::Prompt(_)));

    let err = manager.send_input(handle, "bob").await.expect_err("stdin closed");
    let AppError::InvalidState(message) = &err else {
        panic!("expected invalid state, got {err:?}");
    };
    assert!(message.contains("input not delivered"), "got {message}");

    let outcome = manager.wait(handle).await.expect("wait");
    assert_eq!(outcome.state, SessionState::Completed);
    assert!(matches!(
        manager.send_input(handle, "late").await,
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test]
async fn successive_prompts_are_each_detected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(
                temp.path(),
                "printf 'Identity: '; read id; printf 'Network: '; read net; echo \"$id@$net\"",
            ),
            EventFilter::Prompts,
        )
        .await
        .expect("start");

    let mut answered = Vec::new();
    for answer in ["alice", "ic"] {
        let SessionEvent::Prompt(prompt) = next_event(&mut sub).await else {
            panic!("expected prompt");
        };
        answered.push(prompt.prompt_text);
        manager.send_input(handle, answer).await.expect("answer");
    }

    let (_, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(answered, vec!["Identity:", "Network:"]);
    assert_eq!(outcome.stdout, "Identity: Network: alice@ic\n");
}

#[tokio::test]
async fn prompt_on_stderr_is_detected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "printf 'Continue? [y/N] ' >&2; read a; echo \"$a\""),
            EventFilter::Prompts,
        )
        .await
        .expect("start");

    let SessionEvent::Prompt(prompt) = next_event(&mut sub).await else {
        panic!("expected prompt");
    };
    assert_eq!(prompt.source, StreamSource::Stderr);
    assert_eq!(prompt.prompt_text, "Continue? [y/N]");

    manager.send_input(handle, "y").await.expect("answer");
    let (_, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(outcome.stdout, "y\n");
}

#[tokio::test]
async fn send_anyway_answers_unrecognized_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "printf 'type something'; read v; echo \"[$v]\""),
            EventFilter::All,
        )
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        manager.state(handle).await.expect("state"),
        SessionState::Running,
        "text without prompt punctuation must not be detected"
    );

    manager.send_anyway(handle, "manual").await.expect("forced input");
    let (events, outcome) = collect_until_finished(&mut sub).await;
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Prompt(_))));
    assert_eq!(outcome.stdout, "type something[manual]\n");
}

#[tokio::test]
async fn late_prompt_subscriber_receives_pending_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut first) = manager
        .start_subscribed(sh(temp.path(), "printf 'Password: '; read p"), EventFilter::Prompts)
        .await
        .expect("start");
    let _ = next_event(&mut first).await;

    let mut late = manager
        .subscribe(handle, EventFilter::Prompts)
        .await
        .expect("subscribe");
    let SessionEvent::Prompt(prompt) = next_event(&mut late).await else {
        panic!("late subscriber must see the pending prompt");
    };
    assert_eq!(prompt.prompt_text, "Password:");

    manager.terminate(handle).await.expect("terminate");
}

#[tokio::test]
async fn unsubscribed_observer_stops_receiving() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let (handle, mut kept) = manager
        .start_subscribed(sh(temp.path(), "printf 'Go? '; read x; echo after"), EventFilter::All)
        .await
        .expect("start");
    let mut dropped = manager
        .subscribe(handle, EventFilter::All)
        .await
        .expect("subscribe");

    let _ = next_event(&mut kept).await;
    manager
        .unsubscribe(handle, dropped.id())
        .await
        .expect("unsubscribe");
    manager.send_input(handle, "y").await.expect("answer");

    let (events, _) = collect_until_finished(&mut kept).await;
    assert_eq!(output_text(&events), "Go? after\n");

    // Anything queued before unsubscribing may remain; nothing after it.
    while let Some(event) = dropped.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Finished(_)),
            "unsubscribed observer must not see later events"
        );
    }
}

struct ReadyDetector;

impl PromptDetector for ReadyDetector {
    fn evaluate(&self, tail: &str) -> Detection {
        if tail.ends_with("READY") {
            Detection::Prompt("READY".into())
        } else {
            Detection::NoPrompt
        }
    }
}

#[tokio::test]
async fn custom_detector_can_replace_patterns() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::with_components(
        test_config(temp.path()),
        Arc::new(ReadyDetector),
        None,
    );

    let (handle, mut sub) = manager
        .start_subscribed(
            sh(temp.path(), "printf 'Name: '; sleep 0.3; printf 'READY'; read x; echo ok"),
            EventFilter::Prompts,
        )
        .await
        .expect("start");

    let SessionEvent::Prompt(prompt) = next_event(&mut sub).await else {
        panic!("expected prompt");
    };
    assert_eq!(prompt.prompt_text, "READY");

    manager.send_input(handle, "go").await.expect("answer");
    let (_, outcome) = collect_until_finished(&mut sub).await;
    assert_eq!(outcome.stdout, "Name: READYok\n");
}
