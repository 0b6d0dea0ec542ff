pub mod config;
pub mod consumer;
pub mod cursor;
pub mod delivery;
pub mod error;
pub mod router;
pub mod storage;
pub mod store;
pub mod topic;

use crate::broker::config::{BrokerConfig, RetentionPolicy};
use crate::broker::consumer::coordinator::GroupCoordinator;
use crate::broker::consumer::group::GroupState;
use crate::broker::cursor::CursorTable;
use crate::broker::error::{BrokerError, Result};
use crate::broker::router::{Destination, ExchangeKind, Router, select_partition};
use crate::broker::storage::{Snapshot, Storage};
use crate::broker::store::MessageStore;
use crate::message::ack::{AckMode, PublishAck};
use crate::message::record::{Message, ProducerRecord, TopicPartition};
use crate::subscriber::types::{Assignment, Delivery, GroupMode, HeartbeatStatus, JoinOptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// Upper bound on one wait inside [`Broker::poll_wait`]. Redeliveries are not
/// signalled by appends, so the wait is re-armed periodically.
const POLL_WAIT_SLICE: Duration = Duration::from_millis(50);

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: Vec<String>,
    pub redelivered: usize,
    pub truncated: u64,
}

pub struct Broker {
    pub id: String,
    config: BrokerConfig,
    store: MessageStore,
    router: Router,
    coordinator: GroupCoordinator,
    cursors: CursorTable,
    storage: Option<Mutex<Storage>>,
}

impl Broker {
    /// Creates a new broker instance.
    ///
    /// With `state_dir` configured, committed cursors from the last snapshot
    /// are restored.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::Broker;
    /// use rust_broker_core::broker::config::BrokerConfig;
    ///
    /// let broker = Broker::new("broker1", BrokerConfig::default()).unwrap();
    /// assert_eq!(broker.id, "broker1");
    /// ```
    pub fn new(id: &str, config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let cursors = CursorTable::new();
        let storage = match &config.state_dir {
            Some(dir) => {
                let storage = Storage::new(dir)?;
                if let Some(snapshot) = storage.load()? {
                    cursors.restore(&snapshot.cursors);
                    log::info!(
                        "Broker {} restored cursors for {} groups from {}",
                        id,
                        snapshot.cursors.len(),
                        storage.path().display()
                    );
                }
                Some(Mutex::new(storage))
            }
            None => None,
        };

        Ok(Broker {
            id: id.to_string(),
            coordinator: GroupCoordinator::new(&config),
            config,
            store: MessageStore::new(),
            router: Router::new(),
            cursors,
            storage,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Runs `operation` until it succeeds, retrying up to `max_retries` times
    /// with a doubling delay.
    pub fn perform_operation_with_retry<F, T, E>(
        &self,
        operation: F,
        max_retries: u32,
        delay: Duration,
    ) -> std::result::Result<T, E>
    where
        F: Fn() -> std::result::Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempts = 0;
        let mut delay = delay;
        loop {
            match operation() {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempts >= max_retries {
                        return Err(e);
                    }
                    attempts += 1;
                    log::warn!("Operation failed: {}. Retry {} of {}", e, attempts, max_retries);
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    /// Creates a topic. `None` uses the configured default partition count.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::Broker;
    /// use rust_broker_core::broker::config::BrokerConfig;
    ///
    /// let broker = Broker::new("broker1", BrokerConfig::default()).unwrap();
    /// broker.create_topic("orders", Some(3)).unwrap();
    /// assert_eq!(broker.store().partition_count("orders").unwrap(), 3);
    /// ```
    pub fn create_topic(&self, name: &str, partitions: Option<u32>) -> Result<()> {
        self.create_topic_with_retention(name, partitions, self.config.retention.clone())
    }

    pub fn create_topic_with_retention(
        &self,
        name: &str,
        partitions: Option<u32>,
        retention: RetentionPolicy,
    ) -> Result<()> {
        let partitions = partitions.unwrap_or(self.config.default_partitions);
        self.store.create_topic(name, partitions, retention)
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        dead_letter: Option<Destination>,
    ) -> Result<()> {
        if let Some(destination) = &dead_letter {
            self.check_destination(destination)?;
        }
        self.router.declare(name, kind, dead_letter)
    }

    /// Binds `destination` to `exchange` under `pattern`. Fanout exchanges
    /// ignore the pattern.
    pub fn create_binding(&self, exchange: &str, pattern: &str, destination: Destination) -> Result<()> {
        self.check_destination(&destination)?;
        self.router.bind(exchange, pattern, destination)
    }

    /// Removes a binding. Returns whether one existed.
    pub fn delete_binding(&self, exchange: &str, pattern: &str, destination: &Destination) -> Result<bool> {
        self.router.unbind(exchange, pattern, destination)
    }

    fn check_destination(&self, destination: &Destination) -> Result<()> {
        let topic = self.store.topic(&destination.topic)?;
        if let Some(partition) = destination.partition {
            topic.partition(partition)?;
        }
        Ok(())
    }

    /// Publishes to an exchange, or to a topic when no exchange has that
    /// name. Every matched destination receives exactly one copy.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::Broker;
    /// use rust_broker_core::broker::config::BrokerConfig;
    /// use rust_broker_core::message::record::ProducerRecord;
    ///
    /// let broker = Broker::new("broker1", BrokerConfig::default()).unwrap();
    /// broker.create_topic("orders", None).unwrap();
    /// let ack = broker.publish("orders", ProducerRecord::new(b"hello".to_vec())).unwrap();
    /// assert_eq!(ack.offset(), Some(0));
    /// ```
    pub fn publish(&self, destination: &str, record: ProducerRecord) -> Result<PublishAck> {
        let targets = if self.router.contains(destination) {
            self.router.route(destination, record.routing_key.as_deref())?
        } else {
            vec![Destination {
                topic: destination.to_string(),
                partition: record.partition,
            }]
        };

        // Resolve every target before writing so a bad one fails the whole publish.
        let mut resolved = Vec::with_capacity(targets.len());
        for target in &targets {
            let topic = self.store.topic(&target.topic)?;
            let partition = select_partition(&topic, record.key(), target.partition)?;
            resolved.push((topic, partition));
        }

        let mut written = Vec::with_capacity(resolved.len());
        for (topic, partition) in resolved {
            let offset = topic.partition(partition)?.append(
                record.key().map(<[u8]>::to_vec),
                record.value.clone(),
                record.headers.clone(),
            );
            log::trace!("Published to {}-{} at offset {}", topic.name, partition, offset);
            written.push((TopicPartition::new(&topic.name, partition), offset));
        }
        Ok(PublishAck::new(destination, written))
    }

    /// Joins `group_id`. The returned assignment is already acknowledged;
    /// other members must [`Broker::sync`] before polling resumes.
    pub fn join(
        &self,
        group_id: &str,
        consumer_id: &str,
        topics: &[&str],
        options: JoinOptions,
    ) -> Result<Assignment> {
        self.coordinator
            .join(group_id, consumer_id, topics, &options, &self.store, Instant::now())
    }

    pub fn sync(&self, consumer_id: &str, generation: u32) -> Result<Assignment> {
        self.coordinator.sync(consumer_id, generation)
    }

    pub fn heartbeat(&self, consumer_id: &str) -> Result<HeartbeatStatus> {
        self.heartbeat_at(consumer_id, Instant::now())
    }

    pub fn heartbeat_at(&self, consumer_id: &str, now: Instant) -> Result<HeartbeatStatus> {
        self.coordinator.heartbeat(consumer_id, now)
    }

    pub fn leave(&self, consumer_id: &str) -> Result<()> {
        self.coordinator.leave(consumer_id, &self.store, Instant::now())
    }

    /// Up to `max` deliveries for `consumer_id`, limited by its prefetch.
    pub fn poll(&self, consumer_id: &str, max: usize) -> Result<Vec<Delivery>> {
        self.poll_at(consumer_id, max, Instant::now())
    }

    pub fn poll_at(&self, consumer_id: &str, max: usize, now: Instant) -> Result<Vec<Delivery>> {
        let (group_id, handle) = self.coordinator.group_of(consumer_id)?;
        let mut handle = handle.lock();
        if handle.group.state != GroupState::Stable {
            return Err(BrokerError::RebalanceInProgress {
                group: group_id,
                generation: handle.group.generation,
            });
        }
        let prefetch = handle
            .group
            .member(consumer_id)
            .map(|m| m.prefetch)
            .ok_or_else(|| BrokerError::ConsumerNotFound(consumer_id.to_string()))?;
        let owned = handle.group.assignment_of(consumer_id).to_vec();

        let result = handle
            .delivery
            .pull(consumer_id, &owned, prefetch, max, &self.cursors, &self.store, now)?;
        drop(handle);

        for (tp, message) in &result.dead_lettered {
            self.dead_letter(&group_id, tp, message);
        }
        Ok(result.deliveries)
    }

    /// Like [`Broker::poll`], but waits up to `timeout` for something to
    /// deliver.
    pub fn poll_wait(&self, consumer_id: &str, max: usize, timeout: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let deliveries = self.poll(consumer_id, max)?;
            let now = Instant::now();
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }

            let watched: Vec<(TopicPartition, u64)> = self
                .coordinator
                .assignment(consumer_id)?
                .partitions
                .into_iter()
                .filter_map(|tp| {
                    let (_, end) = self.store.bounds(&tp).ok()?;
                    Some((tp, end))
                })
                .collect();
            self.store
                .wait_for_any(&watched, deadline.min(now + POLL_WAIT_SLICE));
        }
    }

    fn dead_letter(&self, group_id: &str, tp: &TopicPartition, message: &Message) {
        let Some(dlq) = &self.config.dead_letter_topic else {
            log::warn!(
                "Group {} dropped {}@{} after too many deliveries",
                group_id,
                tp,
                message.offset
            );
            return;
        };

        let mut headers = message.headers.clone();
        headers.insert("x-death-topic".to_string(), tp.topic.clone().into_bytes());
        headers.insert("x-death-partition".to_string(), tp.partition.to_string().into_bytes());
        headers.insert("x-death-offset".to_string(), message.offset.to_string().into_bytes());

        let result = self.store.topic(dlq).and_then(|topic| {
            let partition = select_partition(&topic, message.key.as_deref(), None)?;
            Ok(topic
                .partition(partition)?
                .append(message.key.clone(), message.value.clone(), headers))
        });
        match result {
            Ok(offset) => log::info!(
                "Dead lettered {}@{} for group {} to {} at offset {}",
                tp,
                message.offset,
                group_id,
                dlq,
                offset
            ),
            Err(e) => log::warn!("Failed to dead letter {}@{}: {}", tp, message.offset, e),
        }
    }

    /// Acknowledges `offset` on `tp`.
    pub fn ack(&self, consumer_id: &str, tp: &TopicPartition, offset: u64, mode: AckMode) -> Result<()> {
        let (_, handle) = self.coordinator.group_of(consumer_id)?;
        let mut handle = handle.lock();
        if !handle.group.owns(consumer_id, tp) {
            return Err(BrokerError::PartitionNotAssigned {
                consumer: consumer_id.to_string(),
                partition: tp.clone(),
            });
        }
        let exclusive = handle.group.mode == GroupMode::Partitioned;
        handle.delivery.ack(consumer_id, tp, offset, mode, exclusive)
    }

    /// Returns `offset` to the redelivery pool.
    pub fn nack(&self, consumer_id: &str, tp: &TopicPartition, offset: u64) -> Result<()> {
        let (_, handle) = self.coordinator.group_of(consumer_id)?;
        let mut handle = handle.lock();
        if !handle.group.owns(consumer_id, tp) {
            return Err(BrokerError::PartitionNotAssigned {
                consumer: consumer_id.to_string(),
                partition: tp.clone(),
            });
        }
        handle.delivery.nack(consumer_id, tp, offset)
    }

    /// Highest committed offset of `group_id` on `tp`.
    pub fn committed_offset(&self, group_id: &str, tp: &TopicPartition) -> Option<u64> {
        self.cursors.get(group_id, tp).and_then(|c| c.committed())
    }

    pub fn group_state(&self, group_id: &str) -> Result<GroupState> {
        Ok(self.coordinator.group(group_id)?.lock().group.state)
    }

    pub fn assignment(&self, consumer_id: &str) -> Result<Assignment> {
        self.coordinator.assignment(consumer_id)
    }

    pub fn tick(&self) -> MaintenanceReport {
        self.tick_at(Instant::now())
    }

    /// One maintenance pass: session and grace-period evictions, ack
    /// deadline expiry, retention, snapshot.
    pub fn tick_at(&self, now: Instant) -> MaintenanceReport {
        let coordinated = self.coordinator.maintain(&self.store, now);
        let truncated = self.store.enforce_retention(SystemTime::now());
        if let Err(e) = self.checkpoint() {
            log::warn!("Broker {} failed to write snapshot: {}", self.id, e);
        }
        MaintenanceReport {
            evicted: coordinated.evicted,
            redelivered: coordinated.redelivered,
            truncated,
        }
    }

    /// Writes the cursor and membership tables to `state_dir`. A no-op
    /// without one.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let snapshot = Snapshot {
            cursors: self.cursors.snapshot(),
            membership: self.coordinator.membership(),
        };
        let storage = storage.lock();
        self.perform_operation_with_retry(
            || storage.save(&snapshot),
            self.config.storage_retries,
            self.config.storage_retry_backoff(),
        )
        .map_err(|e| BrokerError::Unavailable(format!("snapshot to {}: {}", storage.path().display(), e)))
    }

    /// Runs [`Broker::tick`] every `maintenance_interval_ms` on a background
    /// thread until the handle is stopped or dropped.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let broker: Weak<Broker> = Arc::downgrade(self);
        let interval = self.config.maintenance_interval();
        let flag = Arc::clone(&stop);

        let thread = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                let report = broker.tick();
                if !report.evicted.is_empty() || report.redelivered > 0 {
                    log::debug!("Maintenance on {}: {:?}", broker.id, report);
                }
                drop(broker);
                std::thread::park_timeout(interval);
            }
        });
        MaintenanceHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Stops the maintenance thread when dropped.
pub struct MaintenanceHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::warn!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
