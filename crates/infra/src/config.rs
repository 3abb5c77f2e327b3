//! Configuration loading from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DELAY_QUEUE_BATCH_LIMIT` | `10` |
//! | `DELAY_QUEUE_MAX_ATTEMPTS` | `5` |
//! | `DELAY_QUEUE_BASE_DELAY_MS` | `1` |
//! | `DELAY_QUEUE_MAX_DELAY_MS` | `1000` |
//! | `DELAY_QUEUE_MAX_JITTER_MS` | `100` |
//! | `DELAY_QUEUE_INTERVAL_SECS` | `60` |
//! | `DELAY_QUEUE_STALE_CLAIM_SECS` | unset (sweep disabled) |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `DELAY_QUEUE_STREAM_KEY` | `deferq:jobs` |
//!
//! Claimed items are only deleted by `acknowledge` or by the stale-claim
//! sweep. With persistent stores the consumer lives outside this process, so
//! unless it acknowledges every job, or `DELAY_QUEUE_STALE_CLAIM_SECS` is
//! set, `delay_queue_items` keeps every claimed row forever.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use deferq_core::DEFAULT_PARTITION;

use crate::backoff::BackoffPolicy;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_STREAM_KEY: &str = "deferq:jobs";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var}={value} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of one `DelayQueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueueConfig {
    /// Items examined per `run_once` pass.
    pub batch_limit: usize,
    pub partition: i32,
    pub backoff: BackoffPolicy,
}

impl Default for DelayQueueConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            partition: DEFAULT_PARTITION,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// When the dispatch worker runs, and whether it sweeps stale claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSchedule {
    pub interval: Duration,
    /// Claim age after which an unacknowledged item is deleted. `None` keeps
    /// claimed items until acknowledged.
    pub stale_claim_after: Option<Duration>,
    pub sweep_limit: usize,
}

impl Default for WorkerSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_claim_after: None,
            sweep_limit: 100,
        }
    }
}

/// Everything the taskmaster process needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskmasterConfig {
    pub delay_queue: DelayQueueConfig,
    pub schedule: WorkerSchedule,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub stream_key: String,
}

impl TaskmasterConfig {
    /// Persistent stores with the sweep off: nothing in this process ever
    /// removes claimed rows.
    pub fn claimed_rows_unbounded(&self) -> bool {
        self.use_persistent_stores && self.schedule.stale_claim_after.is_none()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DelayQueueConfig::default();
        let default_schedule = WorkerSchedule::default();

        let backoff = BackoffPolicy {
            max_attempts: parse_or(&lookup, "DELAY_QUEUE_MAX_ATTEMPTS", defaults.backoff.max_attempts)?,
            base_delay: millis_or(&lookup, "DELAY_QUEUE_BASE_DELAY_MS", defaults.backoff.base_delay)?,
            max_delay: millis_or(&lookup, "DELAY_QUEUE_MAX_DELAY_MS", defaults.backoff.max_delay)?,
            max_jitter: millis_or(&lookup, "DELAY_QUEUE_MAX_JITTER_MS", defaults.backoff.max_jitter)?,
        };
        if backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "DELAY_QUEUE_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let batch_limit = parse_or(&lookup, "DELAY_QUEUE_BATCH_LIMIT", defaults.batch_limit)?;
        if batch_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "DELAY_QUEUE_BATCH_LIMIT",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let interval_secs: u64 = parse_or(
            &lookup,
            "DELAY_QUEUE_INTERVAL_SECS",
            default_schedule.interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "DELAY_QUEUE_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let stale_claim_after = match non_empty(&lookup, "DELAY_QUEUE_STALE_CLAIM_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("DELAY_QUEUE_STALE_CLAIM_SECS", &raw)?)),
            None => None,
        };

        let use_persistent_stores = match non_empty(&lookup, "USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool("USE_PERSISTENT_STORES", &raw)?,
            None => false,
        };

        let database_url = non_empty(&lookup, "DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing { var: "DATABASE_URL" });
        }

        Ok(Self {
            delay_queue: DelayQueueConfig {
                batch_limit,
                partition: defaults.partition,
                backoff,
            },
            schedule: WorkerSchedule {
                interval: Duration::from_secs(interval_secs),
                stale_claim_after,
                sweep_limit: default_schedule.sweep_limit,
            },
            use_persistent_stores,
            database_url,
            redis_url: non_empty(&lookup, "REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            stream_key: non_empty(&lookup, "DELAY_QUEUE_STREAM_KEY")
                .unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
        })
    }
}

fn non_empty<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, var) {
        Some(raw) => Ok(Duration::from_millis(parse_value(var, &raw)?)),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
