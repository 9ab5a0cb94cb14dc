//! Sync configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:54321";
pub const DEFAULT_PROBE_TABLE: &str = "shared_settings";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Knobs the connection monitor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Failed replays an operation may accumulate before it is dropped.
    pub max_attempts: u32,
    pub probe_timeout: Duration,
    pub replay_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            probe_timeout: Duration::from_secs(5),
            replay_timeout: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Full client sync configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub auth_token: Option<String>,
    /// Explicit outbox database file; `None` means the platform data dir.
    pub outbox_db: Option<PathBuf>,
    pub probe_table: String,
    pub mapping_retention: chrono::Duration,
    pub monitor: MonitorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            auth_token: None,
            outbox_db: None,
            probe_table: DEFAULT_PROBE_TABLE.to_string(),
            mapping_retention: chrono::Duration::days(30),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Read `FASTNOW_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let api_url = get("FASTNOW_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let initial_interval = parse_millis(
            &get,
            "FASTNOW_PROBE_INTERVAL_MS",
            defaults.monitor.backoff.initial_interval,
        )?;
        let max_interval = parse_millis(
            &get,
            "FASTNOW_PROBE_MAX_INTERVAL_MS",
            defaults.monitor.backoff.max_interval,
        )?;
        if max_interval < initial_interval {
            return Err(ConfigError::Invalid {
                key: "FASTNOW_PROBE_MAX_INTERVAL_MS",
                message: "must not be below FASTNOW_PROBE_INTERVAL_MS".to_string(),
            });
        }

        let factor: f64 = parse(&get, "FASTNOW_BACKOFF_FACTOR", defaults.monitor.backoff.factor)?;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::Invalid {
                key: "FASTNOW_BACKOFF_FACTOR",
                message: format!("must be a finite number >= 1, got {factor}"),
            });
        }

        let retention_days: i64 = parse(&get, "FASTNOW_MAPPING_RETENTION_DAYS", 30)?;
        let mapping_retention =
            chrono::Duration::try_days(retention_days)
                .filter(|d| *d > chrono::Duration::zero())
                .ok_or_else(|| ConfigError::Invalid {
                    key: "FASTNOW_MAPPING_RETENTION_DAYS",
                    message: format!("out of range: {retention_days}"),
                })?;

        Ok(Self {
            api_url,
            api_key: get("FASTNOW_API_KEY"),
            auth_token: get("FASTNOW_AUTH_TOKEN"),
            outbox_db: get("FASTNOW_OUTBOX_DB").map(PathBuf::from),
            probe_table: get("FASTNOW_PROBE_TABLE").unwrap_or(defaults.probe_table),
            mapping_retention,
            monitor: MonitorConfig {
                max_attempts: parse(&get, "FASTNOW_MAX_ATTEMPTS", defaults.monitor.max_attempts)?,
                probe_timeout: parse_millis(
                    &get,
                    "FASTNOW_PROBE_TIMEOUT_MS",
                    defaults.monitor.probe_timeout,
                )?,
                replay_timeout: parse_millis(
                    &get,
                    "FASTNOW_REPLAY_TIMEOUT_MS",
                    defaults.monitor.replay_timeout,
                )?,
                backoff: BackoffPolicy::new(initial_interval, factor, max_interval),
            },
        })
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse(get, key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}
