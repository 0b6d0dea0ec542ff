use crate::message::record::TopicPartition;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Coarse classification of a [`BrokerError`], used by callers to decide
/// whether to retry, reset their position or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown topic, partition, exchange, group or consumer.
    NotFound,
    /// Offset below the retention floor or beyond the log end.
    OutOfRange,
    /// Rebalance in progress or stale assignment. Retry after backoff.
    Conflict,
    /// Heartbeat or ack deadline missed.
    Timeout,
    /// Storage unreachable after internal retries.
    Unavailable,
    /// The request itself is invalid or could not be routed.
    Rejected,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Topic {0} not found")]
    TopicNotFound(String),
    #[error("Partition {partition} out of range for topic {topic} ({count} partitions)")]
    PartitionOutOfRange {
        topic: String,
        partition: u32,
        count: u32,
    },
    #[error("Exchange {0} not found")]
    ExchangeNotFound(String),
    #[error("Consumer group {0} not found")]
    GroupNotFound(String),
    #[error("Consumer {0} not found")]
    ConsumerNotFound(String),
    #[error("Consumer {0} was evicted from its group")]
    Evicted(String),
    #[error("Offset {requested} out of range for {partition}: valid range is {log_start}..{log_end}")]
    OffsetOutOfRange {
        partition: TopicPartition,
        requested: u64,
        log_start: u64,
        log_end: u64,
    },
    #[error("No binding on exchange {exchange} matches routing key {routing_key:?}")]
    NoMatchingBinding {
        exchange: String,
        routing_key: Option<String>,
    },
    #[error("Rebalance in progress for group {group} (generation {generation})")]
    RebalanceInProgress { group: String, generation: u32 },
    #[error("Stale generation {given} for group {group}, current is {current}")]
    StaleGeneration {
        group: String,
        given: u32,
        current: u32,
    },
    #[error("Partition {partition} is not assigned to consumer {consumer}")]
    PartitionNotAssigned {
        consumer: String,
        partition: TopicPartition,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl BrokerError {
    /// Maps the error onto its taxonomy class.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::error::{BrokerError, ErrorKind};
    ///
    /// let error = BrokerError::TopicNotFound("orders".to_string());
    /// assert_eq!(error.kind(), ErrorKind::NotFound);
    /// assert!(!error.is_retryable());
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::TopicNotFound(_)
            | BrokerError::PartitionOutOfRange { .. }
            | BrokerError::ExchangeNotFound(_)
            | BrokerError::GroupNotFound(_)
            | BrokerError::ConsumerNotFound(_) => ErrorKind::NotFound,
            BrokerError::OffsetOutOfRange { .. } => ErrorKind::OutOfRange,
            BrokerError::RebalanceInProgress { .. }
            | BrokerError::StaleGeneration { .. }
            | BrokerError::PartitionNotAssigned { .. } => ErrorKind::Conflict,
            // A missed heartbeat deadline; the consumer may rejoin.
            BrokerError::Evicted(_) => ErrorKind::Timeout,
            BrokerError::Unavailable(_) | BrokerError::IoError(_) => ErrorKind::Unavailable,
            BrokerError::NoMatchingBinding { .. }
            | BrokerError::AlreadyExists(_)
            | BrokerError::InvalidArgument(_)
            | BrokerError::SerializationError(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Timeout | ErrorKind::Unavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_topic_not_found_display() {
        let error = BrokerError::TopicNotFound("orders".to_string());
        assert_eq!(format!("{}", error), "Topic orders not found");
    }

    #[test]
    fn test_partition_out_of_range_display() {
        let error = BrokerError::PartitionOutOfRange {
            topic: "orders".to_string(),
            partition: 7,
            count: 3,
        };
        assert_eq!(
            format!("{}", error),
            "Partition 7 out of range for topic orders (3 partitions)"
        );
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_offset_out_of_range_kind() {
        let error = BrokerError::OffsetOutOfRange {
            partition: TopicPartition::new("orders", 0),
            requested: 2,
            log_start: 5,
            log_end: 9,
        };
        assert_eq!(error.kind(), ErrorKind::OutOfRange);
        assert_eq!(
            format!("{}", error),
            "Offset 2 out of range for orders-0: valid range is 5..9"
        );
    }

    #[test]
    fn test_conflicts_are_retryable() {
        let error = BrokerError::RebalanceInProgress {
            group: "g1".to_string(),
            generation: 4,
        };
        assert!(error.is_retryable());

        let error = BrokerError::NoMatchingBinding {
            exchange: "logs".to_string(),
            routing_key: Some("a.b".to_string()),
        };
        assert!(!error.is_retryable());
        assert_eq!(error.kind(), ErrorKind::Rejected);
    }

    #[test]
    fn test_eviction_is_a_timeout() {
        let error = BrokerError::Evicted("c1".to_string());
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::Other, "disk gone");
        let error: BrokerError = io_error.into();
        assert_eq!(format!("{}", error), "IO error: disk gone");
        assert!(error.source().is_some());
        assert_eq!(error.kind(), ErrorKind::Unavailable);
    }
}
