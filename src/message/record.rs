use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

pub type Headers = BTreeMap<String, Vec<u8>>;

/// Identifies one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: u32) -> Self {
        TopicPartition {
            topic: topic.to_string(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A message as stored in a partition log.
///
/// Messages are created by the owning partition at append time and never
/// mutated afterwards; readers share them through `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: u64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Headers,
    pub enqueued_at: SystemTime,
}

impl Message {
    /// Approximate footprint used by size-based retention.
    pub fn size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.key.as_ref().map_or(0, Vec::len) + self.value.len() + headers) as u64
    }
}

/// What a producer hands to `Broker::publish`.
///
/// # Examples
///
/// ```
/// use rust_broker_core::message::record::ProducerRecord;
///
/// let record = ProducerRecord::new(b"hello".to_vec())
///     .with_routing_key("user.europe.payments")
///     .with_header("content-type", b"text/plain".to_vec());
/// assert_eq!(record.routing_key.as_deref(), Some("user.europe.payments"));
/// assert_eq!(record.headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerRecord {
    /// Routing key for exchanges; doubles as the partitioning key for topics.
    pub routing_key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
    /// Explicit partition override for plain topics.
    pub partition: Option<u32>,
}

impl ProducerRecord {
    pub fn new(value: Vec<u8>) -> Self {
        ProducerRecord {
            value,
            ..Default::default()
        }
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: Vec<u8>) -> Self {
        self.headers.insert(name.to_string(), value);
        self
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref().map(str::as_bytes)
    }
}
