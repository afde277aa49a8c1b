//! Unit tests for `AppError` display and conversions.

use command_assist::AppError;

#[test]
fn display_prefixes_identify_the_category() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Spawn("missing".into()), "spawn: missing"),
        (AppError::InvalidState("busy".into()), "invalid state: busy"),
        (AppError::BufferOverflow("full".into()), "buffer overflow: full"),
        (AppError::WriteFailure("pipe".into()), "write failure: pipe"),
        (AppError::HistoryWrite("disk".into()), "history write: disk"),
        (AppError::NotFound("session".into()), "not found: session"),
        (AppError::Io("eof".into()), "io: eof"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_errors_convert_to_io() {
    let io = std::io::Error::other("boom");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("boom")));
}

#[test]
fn toml_errors_convert_to_config() {
    let toml_err = toml::from_str::<toml::Value>("= nope").expect_err("invalid toml");
    let err: AppError = toml_err.into();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn json_errors_convert_to_history_write() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    let err: AppError = json_err.into();
    assert!(matches!(err, AppError::HistoryWrite(_)));
}

#[test]
fn app_error_is_a_std_error() {
    fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}
    assert_error(&AppError::Io("x".into()));
}
