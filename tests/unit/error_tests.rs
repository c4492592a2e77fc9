//! Unit tests for `AppError` display format and conversions.

use agent_fleet::AppError;

#[test]
fn every_variant_has_a_distinct_prefix() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Db("x".into()), "db: x"),
        (AppError::Host("x".into()), "host: x"),
        (AppError::Tracker("x".into()), "tracker: x"),
        (AppError::Ledger("x".into()), "ledger: x"),
        (AppError::Ipc("x".into()), "ipc: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::InvalidState("x".into()), "invalid state: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn messages_carry_no_trailing_period() {
    let err = AppError::Ledger("append failed".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn toml_errors_become_config_errors() {
    let parse: Result<toml::Value, _> = toml::from_str("= nope");
    let err: AppError = parse.unwrap_err().into();
    assert!(matches!(err, AppError::Config(msg) if msg.starts_with("invalid config")));
}

#[test]
fn json_errors_become_io_errors() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
    let err: AppError = parse.unwrap_err().into();
    assert!(matches!(err, AppError::Io(msg) if msg.starts_with("json:")));
}

#[test]
fn io_errors_keep_their_message() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    assert_eq!(AppError::from(io), AppError::Io("denied".into()));
}
