use crate::broker::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retention applied to every partition of a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Segments whose newest message is older than this are dropped.
    pub max_age_ms: Option<u64>,
    /// Oldest segments are dropped while a partition holds more than this.
    pub max_bytes: Option<u64>,
    /// A segment is sealed once it holds this many messages.
    pub segment_max_messages: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            max_age_ms: None,
            max_bytes: None,
            segment_max_messages: 1024,
        }
    }
}

impl RetentionPolicy {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }
}

/// Broker-wide settings. Every field has a default, so a config file only
/// needs to name what it changes.
///
/// # Examples
///
/// ```
/// use rust_broker_core::broker::config::BrokerConfig;
///
/// let config = BrokerConfig::from_json_str(r#"{ "session_timeout_ms": 20000 }"#).unwrap();
/// assert_eq!(config.session_timeout_ms, 20000);
/// assert_eq!(config.heartbeat_interval_ms, 3000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub heartbeat_interval_ms: u64,
    pub session_timeout_ms: u64,
    /// Grace period for members to acknowledge a new assignment.
    pub rebalance_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub default_prefetch: usize,
    pub default_partitions: u32,
    pub retention: RetentionPolicy,
    pub max_delivery_attempts: Option<u32>,
    pub dead_letter_topic: Option<String>,
    /// Enables snapshots of the cursor and membership tables.
    pub state_dir: Option<PathBuf>,
    pub maintenance_interval_ms: u64,
    pub storage_retries: u32,
    pub storage_retry_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            heartbeat_interval_ms: 3_000,
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 5_000,
            ack_timeout_ms: 30_000,
            default_prefetch: 1,
            default_partitions: 1,
            retention: RetentionPolicy::default(),
            max_delivery_attempts: None,
            dead_letter_topic: None,
            state_dir: None,
            maintenance_interval_ms: 1_000,
            storage_retries: 3,
            storage_retry_backoff_ms: 50,
        }
    }
}

impl BrokerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BrokerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("session_timeout_ms", self.session_timeout_ms),
            ("rebalance_timeout_ms", self.rebalance_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(BrokerError::InvalidArgument(format!("{} must be positive", name)));
            }
        }
        if self.session_timeout_ms <= self.heartbeat_interval_ms {
            return Err(BrokerError::InvalidArgument(
                "session_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.default_prefetch == 0 {
            return Err(BrokerError::InvalidArgument(
                "default_prefetch must be positive".to_string(),
            ));
        }
        if self.default_partitions == 0 {
            return Err(BrokerError::InvalidArgument(
                "default_partitions must be positive".to_string(),
            ));
        }
        if self.retention.segment_max_messages == 0 {
            return Err(BrokerError::InvalidArgument(
                "retention.segment_max_messages must be positive".to_string(),
            ));
        }
        if self.max_delivery_attempts == Some(0) {
            return Err(BrokerError::InvalidArgument(
                "max_delivery_attempts must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn storage_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_retry_backoff_ms)
    }
}
