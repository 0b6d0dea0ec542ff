use crate::broker::config::RetentionPolicy;
use crate::broker::error::{BrokerError, Result};
use crate::broker::topic::Topic;
use crate::message::record::{Headers, Message, TopicPartition};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Registry of topics and entry point for appends and reads.
///
/// The registry lock is only held long enough to clone the topic handle;
/// appends and reads lock the addressed partition alone.
#[derive(Debug, Default)]
pub struct MessageStore {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::config::RetentionPolicy;
    /// use rust_broker_core::broker::store::MessageStore;
    ///
    /// let store = MessageStore::new();
    /// store.create_topic("orders", 2, RetentionPolicy::default()).unwrap();
    /// assert!(store.create_topic("orders", 2, RetentionPolicy::default()).is_err());
    /// assert_eq!(store.partition_count("orders").unwrap(), 2);
    /// ```
    pub fn create_topic(&self, name: &str, partitions: u32, retention: RetentionPolicy) -> Result<()> {
        if name.is_empty() {
            return Err(BrokerError::InvalidArgument("topic name must not be empty".to_string()));
        }
        if partitions == 0 {
            return Err(BrokerError::InvalidArgument(format!(
                "topic {} needs at least one partition",
                name
            )));
        }

        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("Topic {}", name)));
        }
        topics.insert(name.to_string(), Arc::new(Topic::new(name, partitions, retention)));
        log::info!("Created topic {} with {} partitions", name, partitions);
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.read().contains_key(name)
    }

    pub fn partition_count(&self, name: &str) -> Result<u32> {
        Ok(self.topic(name)?.partition_count())
    }

    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<u64> {
        let topic = self.topic(topic)?;
        Ok(topic.partition(partition)?.append(key, value, headers))
    }

    pub fn read(&self, tp: &TopicPartition, from: u64, max: usize) -> Result<Vec<Arc<Message>>> {
        let topic = self.topic(&tp.topic)?;
        topic.partition(tp.partition)?.read(from, max)
    }

    /// Reads one message, or `None` if `offset` is the log end.
    pub fn read_one(&self, tp: &TopicPartition, offset: u64) -> Result<Option<Arc<Message>>> {
        Ok(self.read(tp, offset, 1)?.pop())
    }

    pub fn read_wait(
        &self,
        tp: &TopicPartition,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<Message>>> {
        let topic = self.topic(&tp.topic)?;
        topic.partition(tp.partition)?.read_wait(from, max, timeout)
    }

    /// `(log_start, log_end)` of a partition.
    pub fn bounds(&self, tp: &TopicPartition) -> Result<(u64, u64)> {
        let topic = self.topic(&tp.topic)?;
        let partition = topic.partition(tp.partition)?;
        Ok((partition.log_start(), partition.next_offset()))
    }

    /// Waits until any of `partitions` grows past its recorded end, or the
    /// deadline passes.
    pub fn wait_for_any(&self, partitions: &[(TopicPartition, u64)], deadline: Instant) -> bool {
        let Some(((first, from), rest)) = partitions.split_first() else {
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
            return false;
        };
        if rest.is_empty() {
            return self
                .topic(&first.topic)
                .and_then(|t| Ok(t.partition(first.partition)?.wait_for_append(*from, deadline)))
                .unwrap_or(false);
        }

        // Several partitions: short waits on each in turn.
        let slice = Duration::from_millis(5);
        loop {
            for (tp, from) in partitions {
                let grown = self
                    .bounds(tp)
                    .map(|(_, end)| end > *from)
                    .unwrap_or(false);
                if grown {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }

    /// One retention pass over every topic.
    pub fn enforce_retention(&self, now: SystemTime) -> u64 {
        let topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();
        topics.iter().map(|topic| topic.enforce_retention(now)).sum()
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }
}
