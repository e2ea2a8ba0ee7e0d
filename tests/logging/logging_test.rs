//! Tests for `src/logging.rs`.

use courier::logging::{LoggingGuard, LOG_FILE_NAME};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = match tempfile::tempdir() {
        Ok(tmp) => tmp,
        Err(err) => panic!("temp dir should be created: {err}"),
    };
    let logs_dir = tmp.path().join("nested").join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber can be installed per process, so a failed
    // install is tolerated; the directory must exist either way.
    let _guard = courier::logging::init_production(&logs_dir);
    assert!(logs_dir.exists(), "logs directory should be created");
    assert_eq!(LOG_FILE_NAME, "courier.log");
}

#[test]
fn init_cli_twice_is_harmless() {
    courier::logging::init_cli();
    courier::logging::init_cli();
}
