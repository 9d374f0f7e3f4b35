//! Queue configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fieldqueue_core::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

pub const ENV_DB_PATH: &str = "FIELDQUEUE_DB_PATH";
pub const ENV_MAX_ATTEMPTS: &str = "FIELDQUEUE_MAX_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "FIELDQUEUE_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "FIELDQUEUE_MAX_DELAY_MS";
pub const ENV_DRAIN_INTERVAL_SECS: &str = "FIELDQUEUE_DRAIN_INTERVAL_SECS";
pub const ENV_DELIVERY_TIMEOUT_SECS: &str = "FIELDQUEUE_DELIVERY_TIMEOUT_SECS";

/// Queue and sync engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite file holding the queue.
    pub database_path: PathBuf,
    pub retry: RetryPolicy,
    /// How often to attempt a drain while online
    pub drain_interval: Duration,
    /// Upper bound on a single delivery attempt
    pub delivery_timeout: Duration,
    /// How long completed entries are kept before pruning
    pub completed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retry: RetryPolicy::default(),
            drain_interval: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(30),
            completed_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    /// Defaults overlaid with `FIELDQUEUE_*` environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Unset keys keep their
    /// default; values that do not parse are rejected.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            config.database_path = PathBuf::from(path);
        } else {
            tracing::debug!(key = ENV_DB_PATH, "not set, using default");
        }

        if let Some(n) = parse_var::<u32, _>(&lookup, ENV_MAX_ATTEMPTS)? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_MAX_DELAY_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_DRAIN_INTERVAL_SECS)? {
            config.drain_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_DELIVERY_TIMEOUT_SECS)? {
            config.delivery_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(QueueError::config("max_attempts must be at least 1"));
        }
        if self.drain_interval.is_zero() {
            return Err(QueueError::config("drain_interval must be greater than zero"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(QueueError::config("delivery_timeout must be greater than zero"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(QueueError::config(format!(
                "max_delay ({:?}) is shorter than base_delay ({:?})",
                self.retry.max_delay, self.retry.base_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(QueueError::config(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.retry.jitter
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> QueueResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        tracing::debug!(key, "not set, using default");
        return Ok(None);
    };

    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| QueueError::config(format!("{key}={raw:?}: {e}")))
}

/// `{data_dir}/fieldqueue/queue.db`, falling back to the working directory
/// when the platform has no data directory.
fn default_database_path() -> PathBuf {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .unwrap_or_else(|| PathBuf::from("."));
    dir.push("fieldqueue");
    dir.push("queue.db");
    dir
}
