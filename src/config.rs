//! Configuration for a cohort data directory and its workers.

use crate::error::{CohortError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How change events leave the mutation path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Publish synchronously after commit; failures surface as post-commit errors.
    #[default]
    Immediate,
    /// Write events to the outbox table inside the membership transaction.
    Outbox,
}

impl FromStr for DeliveryMode {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(DeliveryMode::Immediate),
            "outbox" => Ok(DeliveryMode::Outbox),
            other => Err(CohortError::Config(format!("unknown delivery mode {other:?}"))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Upper bound on waiting for a SQLite lock.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Partitions per topic.
    pub partitions: u32,
    /// fsync every N sends (1 = every send is durable before it is acked).
    pub sync_interval: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            sync_interval: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub delivery: DeliveryMode,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_ms: 100,
            delivery: DeliveryMode::Immediate,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Receive wait, and the cadence of schedule sweeps.
    pub poll_interval_ms: u64,
    /// Max scheduled instructions handled per sweep.
    pub sweep_batch: usize,
    /// Keep rows re-added with a later ttl than the instruction being
    /// applied. Permanent rows are always kept.
    pub skip_superseded: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            sweep_batch: 256,
            skip_superseded: false,
        }
    }
}

impl ExpiryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Attempts before an event is dead-lettered.
    pub max_attempts: u32,
    /// Sent events older than this are deleted.
    pub retention_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            batch_size: 100,
            max_attempts: 20,
            retention_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    /// Data directory.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub expiry: ExpiryConfig,
    pub outbox: OutboxConfig,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cohort-data"),
            create_if_missing: true,
            database: DatabaseConfig::default(),
            broker: BrokerConfig::default(),
            publisher: PublisherConfig::default(),
            expiry: ExpiryConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl CohortConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CohortError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `COHORT_*` environment overrides.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = var("COHORT_DATA_DIR") {
            self.path = PathBuf::from(dir);
        }
        if let Some(mode) = var("COHORT_DELIVERY") {
            self.publisher.delivery = mode.parse()?;
        }
        if let Some(v) = var("COHORT_PUBLISH_MAX_RETRIES") {
            self.publisher.max_retries = parse_var("COHORT_PUBLISH_MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("COHORT_EXPIRY_POLL_MS") {
            self.expiry.poll_interval_ms = parse_var("COHORT_EXPIRY_POLL_MS", &v)?;
        }
        if let Some(v) = var("COHORT_DB_BUSY_TIMEOUT_MS") {
            self.database.busy_timeout_ms = parse_var("COHORT_DB_BUSY_TIMEOUT_MS", &v)?;
        }
        Ok(self)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CohortError::Config(format!("{key}={value:?} is not a valid number")))
}
