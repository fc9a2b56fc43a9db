//! Config loading, TOML parsing, and env var override tests.
//!
//! Env override tests are `#[ignore]` (they mutate process env and conflict in parallel).
//! Run them with: `cargo test --test config_tests -- --ignored --test-threads=1`

use std::env;
use std::fs;
use std::path::PathBuf;
use tabkeeper::config::StoreBackend;
use tabkeeper::{Config, ConfigError};
use tempfile::TempDir;

fn write_config(temp: &TempDir, contents: &str) -> String {
    let path = temp.path().join("tabkeeper.toml");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

// Default Configuration Tests
#[test]
fn test_config_default_rate_limits() {
    let config = Config::default();
    assert_eq!(config.rate_limit.session_limit, 30);
    assert_eq!(config.rate_limit.app_limit, 1000);
    assert_eq!(config.rate_limit.burst_limit, 10);
    assert_eq!(config.rate_limit.burst_window_secs, 10);
    assert_eq!(config.rate_limit.stale_after_secs, 3600);
}

#[test]
fn test_config_default_sessions() {
    let config = Config::default();
    assert_eq!(config.sessions.max_sessions, 100);
    assert_eq!(config.sessions.expiry_secs, 3600);
    assert_eq!(config.sessions.memory_per_session_mb, 10);
    assert_eq!(config.sessions.default_balance, 1000.0);
}

#[test]
fn test_config_default_memory_and_cleanup() {
    let config = Config::default();
    assert_eq!(config.memory.pressure_threshold, 0.8);
    assert_eq!(config.memory.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
    assert_eq!(config.cleanup.interval_secs, 300);
    assert_eq!(config.cleanup.shutdown_timeout_ms, 5000);
}

#[test]
fn test_config_default_logging_level() {
    let config = Config::default();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "text");
}

// File Loading Tests
#[test]
fn test_load_config_from_toml() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        &temp,
        r#"
[rate_limit]
session_limit = 12
burst_limit = 4

[sessions]
max_sessions = 8
default_balance = 250.0

[memory]
pressure_threshold = 0.9

[store]
backend = "file"
data_dir = "/tmp/tabkeeper-sessions"

[logging]
level = "debug"
format = "json"
"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.rate_limit.session_limit, 12);
    assert_eq!(config.rate_limit.burst_limit, 4);
    assert_eq!(config.rate_limit.app_limit, 1000);
    assert_eq!(config.sessions.max_sessions, 8);
    assert_eq!(config.sessions.default_balance, 250.0);
    assert_eq!(config.memory.pressure_threshold, 0.9);
    assert_eq!(config.store.backend, StoreBackend::File);
    assert_eq!(
        config.store.data_dir,
        PathBuf::from("/tmp/tabkeeper-sessions")
    );
    assert_eq!(config.logging.format, "json");
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_yields_defaults() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("absent.toml");
    let config = Config::from_file(&path.to_string_lossy()).unwrap();
    assert_eq!(config.rate_limit, Config::default().rate_limit);
}

#[test]
fn test_wrong_type_is_an_error() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "[sessions]\nmax_sessions = \"lots\"\n");
    assert!(Config::from_file(&path).is_err());
}

// Validation Tests
#[test]
fn test_validate_names_zero_field() {
    let mut config = Config::default();
    config.sessions.max_sessions = 0;
    let err = config.validate().unwrap_err();
    assert_eq!(
        err,
        ConfigError::Zero {
            field: "sessions.max_sessions"
        }
    );
    assert_eq!(err.to_string(), "sessions.max_sessions must be greater than zero");
}

#[test]
fn test_validate_rejects_bad_balance() {
    let mut config = Config::default();
    config.sessions.default_balance = -5.0;
    assert_eq!(config.validate(), Err(ConfigError::InvalidBalance(-5.0)));
    config.sessions.default_balance = f64::NAN;
    assert!(matches!(config.validate(), Err(ConfigError::InvalidBalance(_))));
}

#[test]
fn test_validate_rejects_empty_data_dir_for_file_backend() {
    let mut config = Config::default();
    config.store.backend = StoreBackend::File;
    config.store.data_dir = PathBuf::new();
    assert_eq!(config.validate(), Err(ConfigError::EmptyDataDir));

    config.store.backend = StoreBackend::Memory;
    assert!(config.validate().is_ok());
}

#[test]
fn test_threshold_bounds_are_inclusive() {
    let mut config = Config::default();
    config.memory.pressure_threshold = 0.0;
    assert!(config.validate().is_ok());
    config.memory.pressure_threshold = 1.0;
    assert!(config.validate().is_ok());
}

// Environment Variable Override Tests
#[test]
#[ignore = "Requires --test-threads=1 due to process env mutation"]
fn test_prefixed_env_overrides_file() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "[rate_limit]\nsession_limit = 12\n");

    env::set_var("TABKEEPER_RATE_LIMIT__SESSION_LIMIT", "45");
    let config = Config::from_file(&path);
    env::remove_var("TABKEEPER_RATE_LIMIT__SESSION_LIMIT");

    assert_eq!(config.unwrap().rate_limit.session_limit, 45);
}

#[test]
#[ignore = "Requires --test-threads=1 due to process env mutation"]
fn test_flat_deployment_keys() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "");

    env::set_var("SESSION_RATE_LIMIT", "60");
    env::set_var("MAX_SESSIONS_PER_WORKER", "7");
    env::set_var("MEMORY_PRESSURE_THRESHOLD", "0.95");
    let config = Config::from_file(&path);
    env::remove_var("SESSION_RATE_LIMIT");
    env::remove_var("MAX_SESSIONS_PER_WORKER");
    env::remove_var("MEMORY_PRESSURE_THRESHOLD");

    let config = config.unwrap();
    assert_eq!(config.rate_limit.session_limit, 60);
    assert_eq!(config.sessions.max_sessions, 7);
    assert_eq!(config.memory.pressure_threshold, 0.95);
}
