use crate::broker::config::RetentionPolicy;
use crate::broker::error::{BrokerError, Result};
use crate::message::record::{Headers, Message, TopicPartition};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
    pub retention: RetentionPolicy,
    round_robin: AtomicU32,
}

impl Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("partitions", &self.partitions)
            .field("retention", &self.retention)
            .finish()
    }
}

impl Topic {
    /// Creates a new topic. The partition count is fixed for its lifetime.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::config::RetentionPolicy;
    /// use rust_broker_core::broker::topic::Topic;
    ///
    /// let topic = Topic::new("test_topic", 3, RetentionPolicy::default());
    /// assert_eq!(topic.name, "test_topic");
    /// assert_eq!(topic.partitions.len(), 3);
    /// ```
    pub fn new(name: &str, num_partitions: u32, retention: RetentionPolicy) -> Self {
        let partitions = (0..num_partitions)
            .map(|i| Partition::new(name, i, retention.segment_max_messages))
            .collect();

        Topic {
            name: name.to_string(),
            partitions,
            retention,
            round_robin: AtomicU32::new(0),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition(&self, index: u32) -> Result<&Partition> {
        self.partitions
            .get(index as usize)
            .ok_or_else(|| BrokerError::PartitionOutOfRange {
                topic: self.name.clone(),
                partition: index,
                count: self.partition_count(),
            })
    }

    /// Next partition for keyless messages.
    pub fn next_round_robin(&self) -> u32 {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partition_count()
    }

    /// Drops expired segments from every partition, returning how many
    /// messages were removed.
    pub fn enforce_retention(&self, now: SystemTime) -> u64 {
        self.partitions
            .iter()
            .map(|partition| partition.enforce_retention(&self.retention, now))
            .sum()
    }
}

/// A contiguous run of messages starting at `base_offset`.
#[derive(Debug)]
struct Segment {
    base_offset: u64,
    messages: Vec<Arc<Message>>,
    bytes: u64,
}

impl Segment {
    fn new(base_offset: u64) -> Self {
        Segment {
            base_offset,
            messages: Vec::new(),
            bytes: 0,
        }
    }

    fn newest(&self) -> Option<SystemTime> {
        self.messages.last().map(|m| m.enqueued_at)
    }
}

#[derive(Debug)]
struct PartitionLog {
    segments: VecDeque<Segment>,
    log_start: u64,
    next_offset: u64,
    bytes: u64,
}

impl PartitionLog {
    fn read(&self, tp: &TopicPartition, from: u64, max: usize) -> Result<Vec<Arc<Message>>> {
        if from < self.log_start || from > self.next_offset {
            return Err(BrokerError::OffsetOutOfRange {
                partition: tp.clone(),
                requested: from,
                log_start: self.log_start,
                log_end: self.next_offset,
            });
        }

        let mut out = Vec::new();
        for segment in &self.segments {
            let end = segment.base_offset + segment.messages.len() as u64;
            if end <= from {
                continue;
            }
            let skip = from.saturating_sub(segment.base_offset) as usize;
            for message in segment.messages.iter().skip(skip) {
                if out.len() >= max {
                    return Ok(out);
                }
                out.push(Arc::clone(message));
            }
        }
        Ok(out)
    }
}

/// One append-only log. The partition is the only writer of its offsets.
pub struct Partition {
    pub id: u32,
    tp: TopicPartition,
    log: Mutex<PartitionLog>,
    appended: Condvar,
    segment_max_messages: usize,
}

impl Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.log.lock();
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("log_start", &log.log_start)
            .field("next_offset", &log.next_offset)
            .field("segments", &log.segments.len())
            .finish()
    }
}

impl Partition {
    pub fn new(topic: &str, id: u32, segment_max_messages: usize) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::new(0));
        Partition {
            id,
            tp: TopicPartition::new(topic, id),
            log: Mutex::new(PartitionLog {
                segments,
                log_start: 0,
                next_offset: 0,
                bytes: 0,
            }),
            appended: Condvar::new(),
            segment_max_messages: segment_max_messages.max(1),
        }
    }

    /// Appends a message and returns its offset. Offsets are assigned under
    /// the partition lock, so concurrent producers never see gaps.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::topic::Partition;
    /// use std::collections::BTreeMap;
    ///
    /// let partition = Partition::new("orders", 0, 16);
    /// assert_eq!(partition.append(None, b"a".to_vec(), BTreeMap::new()), 0);
    /// assert_eq!(partition.append(None, b"b".to_vec(), BTreeMap::new()), 1);
    /// assert_eq!(partition.next_offset(), 2);
    /// ```
    pub fn append(&self, key: Option<Vec<u8>>, value: Vec<u8>, headers: Headers) -> u64 {
        let mut log = self.log.lock();
        let offset = log.next_offset;
        let message = Arc::new(Message {
            offset,
            key,
            value,
            headers,
            enqueued_at: SystemTime::now(),
        });
        let size = message.size();

        let needs_roll = log
            .segments
            .back()
            .is_none_or(|s| s.messages.len() >= self.segment_max_messages);
        if needs_roll {
            log.segments.push_back(Segment::new(offset));
        }
        if let Some(segment) = log.segments.back_mut() {
            segment.messages.push(message);
            segment.bytes += size;
        }
        log.bytes += size;
        log.next_offset += 1;
        drop(log);

        self.appended.notify_all();
        offset
    }

    /// Reads up to `max` messages starting at `from`. Reading at the log end
    /// yields an empty batch; anything outside `log_start..=log_end` is
    /// `OffsetOutOfRange`.
    pub fn read(&self, from: u64, max: usize) -> Result<Vec<Arc<Message>>> {
        self.log.lock().read(&self.tp, from, max)
    }

    /// Like [`Partition::read`], but waits up to `timeout` for an append when
    /// `from` is at the log end.
    pub fn read_wait(&self, from: u64, max: usize, timeout: Duration) -> Result<Vec<Arc<Message>>> {
        let deadline = Instant::now() + timeout;
        let mut log = self.log.lock();
        while from == log.next_offset && from >= log.log_start {
            if self.appended.wait_until(&mut log, deadline).timed_out() {
                break;
            }
        }
        log.read(&self.tp, from, max)
    }

    /// Blocks until the log grows past `from` or `deadline` passes.
    pub fn wait_for_append(&self, from: u64, deadline: Instant) -> bool {
        let mut log = self.log.lock();
        while log.next_offset <= from {
            if self.appended.wait_until(&mut log, deadline).timed_out() {
                return log.next_offset > from;
            }
        }
        true
    }

    pub fn log_start(&self) -> u64 {
        self.log.lock().log_start
    }

    pub fn next_offset(&self) -> u64 {
        self.log.lock().next_offset
    }

    pub fn size_bytes(&self) -> u64 {
        self.log.lock().bytes
    }

    /// Drops whole segments from the head of the log. The active segment is
    /// never dropped.
    pub fn enforce_retention(&self, policy: &RetentionPolicy, now: SystemTime) -> u64 {
        let mut log = self.log.lock();
        let mut removed = 0u64;

        while log.segments.len() > 1 {
            let Some(oldest) = log.segments.front() else {
                break;
            };
            let expired = match (policy.max_age(), oldest.newest()) {
                (Some(max_age), Some(newest)) => now
                    .duration_since(newest)
                    .is_ok_and(|age| age > max_age),
                _ => false,
            };
            let oversized = policy.max_bytes.is_some_and(|max| log.bytes > max);
            if !expired && !oversized {
                break;
            }

            if let Some(segment) = log.segments.pop_front() {
                removed += segment.messages.len() as u64;
                log.bytes -= segment.bytes;
            }
            if let Some(front) = log.segments.front() {
                log.log_start = front.base_offset;
            }
        }

        if removed > 0 {
            log::info!(
                "Retention truncated {} messages from {}, log now starts at {}",
                removed,
                self.tp,
                log.log_start
            );
        }
        removed
    }
}
