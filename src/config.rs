//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - tabkeeper.toml (default configuration)
//! - tabkeeper.local.toml (git-ignored local overrides)
//! - Environment variables (TABKEEPER_* prefix)
//! - Flat deployment keys (`SESSION_RATE_LIMIT`, `MAX_SESSIONS_PER_WORKER`, ...)
//!
//! ## Example
//!
//! ```toml
//! # tabkeeper.toml
//! [rate_limit]
//! session_limit = 30
//! app_limit = 1000
//! burst_limit = 10
//!
//! [sessions]
//! max_sessions = 100
//! expiry_secs = 3600
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! TABKEEPER_RATE_LIMIT__SESSION_LIMIT=60
//! MEMORY_PRESSURE_THRESHOLD=0.9
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Flat environment keys recognised for container deployments, and the
/// nested config key each one feeds.
const FLAT_ENV_KEYS: &[(&str, &str)] = &[
    ("SESSION_RATE_LIMIT", "rate_limit.session_limit"),
    ("APP_RATE_LIMIT", "rate_limit.app_limit"),
    ("BURST_RATE_LIMIT", "rate_limit.burst_limit"),
    ("MAX_SESSIONS_PER_WORKER", "sessions.max_sessions"),
    ("SESSION_EXPIRY_SECONDS", "sessions.expiry_secs"),
    ("SESSION_MEMORY_MB", "sessions.memory_per_session_mb"),
    ("MEMORY_PRESSURE_THRESHOLD", "memory.pressure_threshold"),
    ("CLEANUP_INTERVAL_SECONDS", "cleanup.interval_secs"),
];

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("memory.pressure_threshold must be within 0.0..=1.0, got {0}")]
    ThresholdOutOfRange(f64),

    #[error("sessions.default_balance must be a finite non-negative amount, got {0}")]
    InvalidBalance(f64),

    #[error("store.data_dir must not be empty when store.backend = \"file\"")]
    EmptyDataDir,
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute allowed for a single session
    #[serde(default = "default_session_limit")]
    pub session_limit: u32,

    /// Requests per minute allowed across the whole process
    #[serde(default = "default_app_limit")]
    pub app_limit: u32,

    /// Requests allowed per session inside one burst window
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Burst window length in seconds
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,

    /// Buckets and burst histories untouched for this long are swept
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

/// Session admission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum number of live sessions per worker
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle time in seconds before a session is expired
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// Estimated memory footprint of one session, in MB
    #[serde(default = "default_memory_per_session_mb")]
    pub memory_per_session_mb: u64,

    /// Opening balance for new sessions
    #[serde(default = "default_balance")]
    pub default_balance: f64,
}

/// Resource monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Utilization (0.0 - 1.0) at which the monitor reports pressure
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,

    /// Minimum seconds between two pressure warnings
    #[serde(default = "default_pressure_cooldown_secs")]
    pub pressure_cooldown_secs: u64,

    /// Root of the cgroup filesystem
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
}

/// Background sweep configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between two sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on how long shutdown waits for a sweeper thread
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Backing store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map (single instance)
    #[default]
    Memory,
    /// One JSON document per session on disk
    File,
}

/// Backing store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory used by the file backend
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_session_limit() -> u32 {
    30
}
fn default_app_limit() -> u32 {
    1000
}
fn default_burst_limit() -> u32 {
    10
}
fn default_burst_window_secs() -> u64 {
    10
}
fn default_stale_after_secs() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    100
}
fn default_expiry_secs() -> u64 {
    3600
}
fn default_memory_per_session_mb() -> u64 {
    10
}
fn default_balance() -> f64 {
    1000.0
}
fn default_pressure_threshold() -> f64 {
    0.8
}
fn default_pressure_cooldown_secs() -> u64 {
    60
}
fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. tabkeeper.toml (base configuration)
    /// 2. tabkeeper.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (TABKEEPER_* prefix)
    /// 4. Flat deployment keys
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("tabkeeper.toml"))
                .merge(Toml::file("tabkeeper.local.toml")),
        )
        .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Self::figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::file(path)),
        )
        .extract()
    }

    fn figment(base: Figment) -> Figment {
        base.merge(Env::prefixed("TABKEEPER_").split("__"))
            .merge(flat_env())
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.session_limit == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.session_limit",
            });
        }
        if self.rate_limit.app_limit == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.app_limit",
            });
        }
        if self.rate_limit.burst_limit == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.burst_limit",
            });
        }
        if self.rate_limit.burst_window_secs == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.burst_window_secs",
            });
        }
        if self.sessions.max_sessions == 0 {
            return Err(ConfigError::Zero {
                field: "sessions.max_sessions",
            });
        }
        if self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "cleanup.interval_secs",
            });
        }
        let threshold = self.memory.pressure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ThresholdOutOfRange(threshold));
        }
        let balance = self.sessions.default_balance;
        if !balance.is_finite() || balance < 0.0 {
            return Err(ConfigError::InvalidBalance(balance));
        }
        if self.store.backend == StoreBackend::File && self.store.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }
        Ok(())
    }
}

/// Map the flat deployment keys onto their nested counterparts
fn flat_env() -> Env {
    Env::raw()
        .only(&FLAT_ENV_KEYS.iter().map(|(k, _)| *k).collect::<Vec<_>>())
        .map(|key| {
            FLAT_ENV_KEYS
                .iter()
                .find(|(flat, _)| key.as_str().eq_ignore_ascii_case(flat))
                .map_or_else(|| key.as_str().to_string(), |(_, nested)| (*nested).to_string())
                .into()
        })
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rate_limit: RateLimitConfig::default(),
            sessions: SessionsConfig::default(),
            memory: MemoryConfig::default(),
            cleanup: CleanupConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            session_limit: default_session_limit(),
            app_limit: default_app_limit(),
            burst_limit: default_burst_limit(),
            burst_window_secs: default_burst_window_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        SessionsConfig {
            max_sessions: default_max_sessions(),
            expiry_secs: default_expiry_secs(),
            memory_per_session_mb: default_memory_per_session_mb(),
            default_balance: default_balance(),
        }
    }
}

impl SessionsConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn memory_per_session_bytes(&self) -> u64 {
        self.memory_per_session_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            pressure_threshold: default_pressure_threshold(),
            pressure_cooldown_secs: default_pressure_cooldown_secs(),
            cgroup_root: default_cgroup_root(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            interval_secs: default_cleanup_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
