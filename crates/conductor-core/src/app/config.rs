//! Engine configuration, read from TOML.
//!
//! Every field has a default, so an empty document is a valid single-node
//! configuration backed by an in-memory database.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::dispatcher::DispatcherConfig;
use super::retry::RetryPolicy;
use crate::observability::LogFormat;
use crate::ports::DEFAULT_SHARD_COUNT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Half-open shard range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub start: u32,
    pub end: u32,
}

impl From<ShardRange> for Range<u32> {
    fn from(r: ShardRange) -> Self {
        r.start..r.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConductorConfig {
    pub database_url: String,
    /// Lease holder name of this process.
    pub instance_id: String,
    pub handoff_capacity: usize,
    pub scan_batch_size: u32,
    pub scan_interval_ms: u64,
    pub expire_interval_ms: u64,
    pub shard_count: u32,
    /// Shards this instance competes for. Absent = own every shard without
    /// taking leases.
    pub owned_shards: Option<ShardRange>,
    pub lock_ttl_secs: u64,
    pub callback_timeout_ms: u64,
    pub callback_max_attempts: u32,
    pub namespace_cache_ttl_secs: u64,
    pub log_format: LogFormat,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            instance_id: "conductor-0".to_string(),
            handoff_capacity: 10_000,
            scan_batch_size: 100,
            scan_interval_ms: 500,
            expire_interval_ms: 5_000,
            shard_count: DEFAULT_SHARD_COUNT,
            owned_shards: None,
            lock_ttl_secs: 30,
            callback_timeout_ms: 10_000,
            callback_max_attempts: 3,
            namespace_cache_ttl_secs: 60,
            log_format: LogFormat::Text,
        }
    }
}

impl ConductorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.database_url.is_empty() {
            return invalid("database_url is empty");
        }
        if self.instance_id.is_empty() {
            return invalid("instance_id is empty");
        }
        if self.handoff_capacity == 0 {
            return invalid("handoff_capacity must be positive");
        }
        if self.scan_batch_size == 0 {
            return invalid("scan_batch_size must be positive");
        }
        if self.shard_count == 0 {
            return invalid("shard_count must be positive");
        }
        if let Some(range) = self.owned_shards {
            if range.start >= range.end || range.end > self.shard_count {
                return Err(ConfigError::Invalid(format!(
                    "owned_shards {}..{} is not a non-empty range within 0..{}",
                    range.start, range.end, self.shard_count
                )));
            }
            if self.lock_ttl_secs == 0 {
                return invalid("lock_ttl_secs must be positive when owned_shards is set");
            }
        }
        if self.callback_max_attempts == 0 {
            return invalid("callback_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            handoff_capacity: self.handoff_capacity,
            scan_batch_size: self.scan_batch_size,
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            expire_interval: Duration::from_millis(self.expire_interval_ms),
        }
    }

    pub fn callback_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.callback_max_attempts)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn namespace_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.namespace_cache_ttl_secs)
    }
}
