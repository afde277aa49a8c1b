//! Integration tests for per-channel session exclusivity.

use command_assist::models::session::SessionState;
use command_assist::{AppError, SessionManager};

use super::test_helpers::{sh, test_config};

#[tokio::test]
async fn second_session_on_busy_channel_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let first = manager
        .start(sh(temp.path(), "sleep 30").with_channel("ops"))
        .await
        .expect("first start");

    let err = manager
        .start(sh(temp.path(), "echo second").with_channel("ops"))
        .await
        .expect_err("channel is busy");
    assert!(
        matches!(err, AppError::InvalidState(ref msg) if msg.contains("ops")),
        "got {err:?}"
    );
    assert_eq!(manager.active_on_channel("ops").await, Some(first));
    assert_eq!(manager.list().await.len(), 1);

    manager.terminate(first).await.expect("terminate");
}

#[tokio::test]
async fn channels_are_independent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let ops = manager
        .start(sh(temp.path(), "sleep 30").with_channel("ops"))
        .await
        .expect("ops");
    let dev = manager
        .start(sh(temp.path(), "sleep 30").with_channel("dev"))
        .await
        .expect("dev");
    let unbound = manager
        .start(sh(temp.path(), "sleep 30"))
        .await
        .expect("no channel");

    assert_eq!(manager.active_on_channel("ops").await, Some(ops));
    assert_eq!(manager.active_on_channel("dev").await, Some(dev));
    assert_eq!(manager.active_on_channel("qa").await, None);

    manager.shutdown().await;
    assert_eq!(
        manager.state(unbound).await.expect("state"),
        SessionState::Terminated
    );
}

#[tokio::test]
async fn finished_session_releases_its_channel() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(test_config(temp.path())).expect("manager");

    let first = manager
        .start(sh(temp.path(), "sleep 30").with_channel("ops"))
        .await
        .expect("first");
    manager.terminate(first).await.expect("terminate");
    assert_eq!(manager.active_on_channel("ops").await, None);

    let second = manager
        .start(sh(temp.path(), "echo again").with_channel("ops"))
        .await
        .expect("channel is free again");
    let outcome = manager.wait(second).await.expect("wait");
    assert_eq!(outcome.stdout, "again\n");

    // The earlier finished session was released when the channel was reused.
    assert!(matches!(
        manager.state(first).await,
        Err(AppError::NotFound(_))
    ));
}
