//! Configuration types.
//!
//! Every struct has a `Default` matching the documented defaults and a
//! `from_env()` that overrides fields from `COMIC_BATCH_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read `key` and parse it, falling back to `default` when unset or empty.
///
/// A value that is present but unparsable is an error rather than silently
/// replaced by the default.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
        }
        _ => Ok(default),
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn require_positive(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Process-level settings for the service binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
    /// Restricts the built-in inspector to archives under this directory.
    pub library_root: Option<PathBuf>,
    pub manager: ManagerConfig,
    pub reaper: ReaperConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/comic-batch.db"),
            log_dir: None,
            library_root: None,
            manager: ManagerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: env_or("COMIC_BATCH_PORT", defaults.port)?,
            db_path: env_path("COMIC_BATCH_DB_PATH").unwrap_or(defaults.db_path),
            log_dir: env_path("COMIC_BATCH_LOG_DIR"),
            library_root: env_path("COMIC_BATCH_LIBRARY_ROOT"),
            manager: ManagerConfig::from_env()?,
            reaper: ReaperConfig::from_env()?,
        })
    }
}

/// Job manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum items processed concurrently per job.
    pub max_workers: usize,
    /// Attempts made to deliver the terminal event while nobody listens.
    pub terminal_retries: u32,
    /// Fixed delay between terminal delivery attempts.
    pub terminal_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            terminal_retries: 3,
            terminal_retry_delay: Duration::from_millis(500),
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_workers = require_positive(
            "COMIC_BATCH_MAX_WORKERS",
            env_or("COMIC_BATCH_MAX_WORKERS", defaults.max_workers as u64)?,
        )?;
        let terminal_retries = env_or("COMIC_BATCH_TERMINAL_RETRIES", defaults.terminal_retries)?;
        let delay_ms: u64 = env_or(
            "COMIC_BATCH_TERMINAL_RETRY_DELAY_MS",
            defaults.terminal_retry_delay.as_millis() as u64,
        )?;

        Ok(Self {
            max_workers: max_workers as usize,
            terminal_retries: terminal_retries.max(1),
            terminal_retry_delay: Duration::from_millis(delay_ms),
        })
    }
}

/// Retention policy for finished jobs.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How long a terminal job is kept after `completed_at`.
    pub retention: Duration,
    /// How often the reaper runs.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600), // 1 hour
            interval: Duration::from_secs(300),   // 5 minutes
        }
    }
}

impl ReaperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retention = env_or("COMIC_BATCH_RETENTION_SECS", defaults.retention.as_secs())?;
        let interval = require_positive(
            "COMIC_BATCH_REAP_INTERVAL_SECS",
            env_or("COMIC_BATCH_REAP_INTERVAL_SECS", defaults.interval.as_secs())?,
        )?;
        Ok(Self {
            retention: Duration::from_secs(retention),
            interval: Duration::from_secs(interval),
        })
    }
}

/// Timings for the job watcher client.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pause before reconnecting a dropped push connection.
    pub reconnect_delay: Duration,
    /// Silence longer than this forces a direct status read.
    pub inactivity_window: Duration,
    /// How often the watchdog checks for silence.
    pub watchdog_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            inactivity_window: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(15),
        }
    }
}

impl WatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let reconnect_ms = env_or(
            "COMIC_BATCH_RECONNECT_DELAY_MS",
            defaults.reconnect_delay.as_millis() as u64,
        )?;
        let inactivity_ms = require_positive(
            "COMIC_BATCH_INACTIVITY_WINDOW_MS",
            env_or(
                "COMIC_BATCH_INACTIVITY_WINDOW_MS",
                defaults.inactivity_window.as_millis() as u64,
            )?,
        )?;
        let watchdog_ms = require_positive(
            "COMIC_BATCH_WATCHDOG_INTERVAL_MS",
            env_or(
                "COMIC_BATCH_WATCHDOG_INTERVAL_MS",
                defaults.watchdog_interval.as_millis() as u64,
            )?,
        )?;
        Ok(Self {
            reconnect_delay: Duration::from_millis(reconnect_ms),
            inactivity_window: Duration::from_millis(inactivity_ms),
            watchdog_interval: Duration::from_millis(watchdog_ms),
        })
    }
}
