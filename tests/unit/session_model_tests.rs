//! Unit tests for session, output and prompt models.

use std::path::PathBuf;

use command_assist::models::output::{EventFilter, OutputEvent, SessionEvent, StreamSource};
use command_assist::models::prompt::PromptRequest;
use command_assist::models::session::{
    Session, SessionHandle, SessionOutcome, SessionState, SpawnRequest,
};
use command_assist::AppError;

const ALL_STATES: [SessionState; 6] = [
    SessionState::Spawning,
    SessionState::Running,
    SessionState::WaitingForInput,
    SessionState::Completed,
    SessionState::Terminated,
    SessionState::Failed,
];

fn request() -> SpawnRequest {
    SpawnRequest::new("dfx", "/tmp/project")
        .with_subcommand("deploy")
        .with_args(["--network", "ic"])
}

#[test]
fn terminal_states_are_absorbing() {
    for from in ALL_STATES.iter().filter(|s| s.is_terminal()) {
        for to in ALL_STATES {
            assert!(
                !from.can_transition_to(to),
                "{from} must not transition to {to}"
            );
        }
    }
}

#[test]
fn permitted_transitions() {
    use SessionState::{Completed, Failed, Running, Spawning, Terminated, WaitingForInput};

    assert!(Spawning.can_transition_to(Running));
    assert!(Spawning.can_transition_to(Failed));
    assert!(!Spawning.can_transition_to(WaitingForInput));
    assert!(!Spawning.can_transition_to(Terminated));

    assert!(Running.can_transition_to(WaitingForInput));
    assert!(WaitingForInput.can_transition_to(Running));
    for end in [Completed, Terminated, Failed] {
        assert!(Running.can_transition_to(end));
        assert!(WaitingForInput.can_transition_to(end));
    }
    assert!(!Running.can_transition_to(Spawning));
}

#[test]
fn active_is_the_complement_of_terminal() {
    for state in ALL_STATES {
        assert_ne!(state.is_active(), state.is_terminal());
    }
}

#[test]
fn state_display_is_snake_case() {
    assert_eq!(SessionState::WaitingForInput.to_string(), "waiting_for_input");
    assert_eq!(
        serde_json::to_string(&SessionState::WaitingForInput).unwrap(),
        "\"waiting_for_input\""
    );
}

#[test]
fn new_session_starts_spawning_with_request_fields() {
    let handle = SessionHandle::new();
    let session = Session::new(handle, &request());

    assert_eq!(session.handle, handle);
    assert_eq!(session.state, SessionState::Spawning);
    assert_eq!(session.command, "dfx");
    assert_eq!(session.subcommand.as_deref(), Some("deploy"));
    assert_eq!(session.working_directory, PathBuf::from("/tmp/project"));
    assert!(session.stdout.is_empty());
    assert_eq!(session.captured_bytes(), 0);
}

#[test]
fn illegal_transition_is_invalid_state() {
    let mut session = Session::new(SessionHandle::new(), &request());
    let err = session
        .transition(SessionState::WaitingForInput)
        .expect_err("spawning cannot wait for input");
    assert!(matches!(err, AppError::InvalidState(_)));
    assert_eq!(session.state, SessionState::Spawning);
}

#[test]
fn leaving_waiting_clears_pending_prompt() {
    let mut session = Session::new(SessionHandle::new(), &request());
    session.transition(SessionState::Running).unwrap();
    session.transition(SessionState::WaitingForInput).unwrap();
    session.pending_prompt = Some("Continue? [y/N]".into());

    session.transition(SessionState::Running).unwrap();

    assert_eq!(session.pending_prompt, None);
}

#[test]
fn argv_puts_subcommand_before_args() {
    let request = request();
    assert_eq!(request.child_args(), vec!["deploy", "--network", "ic"]);
    assert_eq!(request.argv(), vec!["dfx", "deploy", "--network", "ic"]);
}

#[test]
fn command_line_quotes_special_arguments() {
    let request = SpawnRequest::new("sh", "/tmp").with_args(["-c", "echo 'hi there'", ""]);
    assert_eq!(
        request.command_line(),
        r"sh -c 'echo '\''hi there'\''' ''"
    );
    assert_eq!(
        SpawnRequest::new("dfx", "/").with_args(["--network=ic"]).command_line(),
        "dfx --network=ic"
    );
}

#[test]
fn outcome_result_text_prefers_stdout_on_success() {
    let handle = SessionHandle::new();
    let mut outcome = SessionOutcome {
        handle,
        state: SessionState::Completed,
        exit_code: Some(0),
        stdout: "ok\n".into(),
        stderr: "warning\n".into(),
        reason: None,
    };
    assert!(outcome.success());
    assert_eq!(outcome.result_text(), "ok\n");

    outcome.exit_code = Some(2);
    assert!(!outcome.success());
    assert_eq!(outcome.result_text(), "warning\n");

    outcome.state = SessionState::Terminated;
    outcome.exit_code = None;
    outcome.stderr.clear();
    outcome.reason = Some("terminated on request".into());
    assert_eq!(outcome.result_text(), "terminated on request");
}

#[test]
fn handles_are_unique_and_serialize_transparently() {
    let a = SessionHandle::new();
    let b = SessionHandle::new();
    assert_ne!(a, b);

    let json = serde_json::to_string(&a).unwrap();
    assert_eq!(json, format!("\"{a}\""));
    let back: SessionHandle = serde_json::from_str(&json).unwrap();
    assert_eq!(back, a);
}

#[test]
fn event_filters_route_events() {
    let handle = SessionHandle::new();
    let output = SessionEvent::Output(OutputEvent {
        handle,
        source: StreamSource::Stdout,
        text: "x\n".into(),
        sequence: 1,
    });
    let prompt = SessionEvent::Prompt(PromptRequest {
        handle,
        prompt_text: "Name:".into(),
        source: StreamSource::Stdout,
        after_sequence: 1,
    });
    let warning = SessionEvent::Warning {
        handle,
        message: "history".into(),
    };

    assert!(EventFilter::All.accepts(&output));
    assert!(EventFilter::All.accepts(&prompt));
    assert!(EventFilter::Output.accepts(&output));
    assert!(!EventFilter::Output.accepts(&prompt));
    assert!(EventFilter::Prompts.accepts(&prompt));
    assert!(!EventFilter::Prompts.accepts(&output));
    assert!(EventFilter::Prompts.accepts(&warning));
    assert!(EventFilter::Output.accepts(&warning));
    assert_eq!(EventFilter::default(), EventFilter::All);
}
