use crate::broker::config::BrokerConfig;
use crate::broker::consumer::group::{ConsumerGroup, GroupMember, TopicLayout};
use crate::broker::consumer::heartbeat::Heartbeat;
use crate::broker::delivery::DeliveryManager;
use crate::broker::error::{BrokerError, Result};
use crate::broker::store::MessageStore;
use crate::subscriber::types::{Assignment, HeartbeatStatus, JoinOptions};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

/// A group together with its delivery state. Both live under one lock so a
/// rebalance can drain in-flight tracking before the new assignment is served.
#[derive(Debug)]
pub struct GroupHandle {
    pub group: ConsumerGroup,
    pub delivery: DeliveryManager,
}

impl GroupHandle {
    fn layout(&self, store: &MessageStore) -> TopicLayout {
        self.group
            .subscribed_topics()
            .into_iter()
            .filter_map(|topic| {
                let count = store.partition_count(&topic).ok()?;
                Some((topic, count))
            })
            .collect()
    }

    /// Stop-the-world step: release every delivery, then reassign.
    fn rebalance(
        &mut self,
        store: &MessageStore,
        now: Instant,
        grace: Duration,
        acknowledged: Option<&str>,
    ) -> usize {
        let released = self.delivery.release_all();
        let layout = self.layout(store);
        self.group.rebalance(&layout, now, grace, acknowledged);
        released
    }

    fn assignment(&self, consumer_id: &str, heartbeat_interval: Duration) -> Assignment {
        Assignment {
            group_id: self.group.group_id.clone(),
            generation: self.group.generation,
            partitions: self.group.assignment_of(consumer_id).to_vec(),
            heartbeat_interval,
        }
    }
}

/// Result of one coordinator maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub evicted: Vec<String>,
    pub redelivered: usize,
}

/// Group registry plus the consumer to group index.
///
/// Lock order: a group handle is locked before `members` or `evicted`, and
/// the registry lock is never held while a handle is locked.
#[derive(Debug)]
pub struct GroupCoordinator {
    config: BrokerConfig,
    groups: RwLock<HashMap<String, Arc<Mutex<GroupHandle>>>>,
    members: RwLock<HashMap<String, String>>,
    /// Recently evicted consumers and when, kept for one session timeout.
    evicted: RwLock<HashMap<String, Instant>>,
}

impl GroupCoordinator {
    pub fn new(config: &BrokerConfig) -> Self {
        GroupCoordinator {
            config: config.clone(),
            groups: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            evicted: RwLock::new(HashMap::new()),
        }
    }

    pub fn group(&self, group_id: &str) -> Result<Arc<Mutex<GroupHandle>>> {
        self.groups
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| BrokerError::GroupNotFound(group_id.to_string()))
    }

    fn group_or_create(&self, group_id: &str) -> Arc<Mutex<GroupHandle>> {
        if let Some(handle) = self.groups.read().get(group_id) {
            return Arc::clone(handle);
        }
        let mut groups = self.groups.write();
        Arc::clone(groups.entry(group_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(GroupHandle {
                group: ConsumerGroup::new(group_id),
                delivery: DeliveryManager::new(
                    group_id,
                    self.config.ack_timeout(),
                    self.config.max_delivery_attempts,
                ),
            }))
        }))
    }

    /// The group `consumer_id` belongs to.
    pub fn group_of(&self, consumer_id: &str) -> Result<(String, Arc<Mutex<GroupHandle>>)> {
        let group_id = self.members.read().get(consumer_id).cloned();
        match group_id {
            Some(group_id) => {
                let handle = self.group(&group_id)?;
                Ok((group_id, handle))
            }
            None if self.evicted.read().contains_key(consumer_id) => {
                Err(BrokerError::Evicted(consumer_id.to_string()))
            }
            None => Err(BrokerError::ConsumerNotFound(consumer_id.to_string())),
        }
    }

    /// Adds `consumer_id` to `group_id`, subscribed to `topics`, and
    /// rebalances the group. The returned assignment is already
    /// acknowledged for the joiner.
    pub fn join(
        &self,
        group_id: &str,
        consumer_id: &str,
        topics: &[&str],
        options: &JoinOptions,
        store: &MessageStore,
        now: Instant,
    ) -> Result<Assignment> {
        if group_id.is_empty() || consumer_id.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "group and consumer ids must not be empty".to_string(),
            ));
        }
        if topics.is_empty() {
            return Err(BrokerError::InvalidArgument(format!(
                "consumer {} must subscribe to at least one topic",
                consumer_id
            )));
        }
        for topic in topics {
            if !store.contains(topic) {
                return Err(BrokerError::TopicNotFound(topic.to_string()));
            }
        }
        let prefetch = options.prefetch.unwrap_or(self.config.default_prefetch);
        if prefetch == 0 {
            return Err(BrokerError::InvalidArgument("prefetch must be at least 1".to_string()));
        }

        Self::check_not_elsewhere(consumer_id, group_id, &self.members.read())?;

        let handle = self.group_or_create(group_id);
        let mut handle = handle.lock();
        {
            let mut members = self.members.write();
            // Re-checked: a concurrent join may have won since the read.
            Self::check_not_elsewhere(consumer_id, group_id, &members)?;
            let topics: BTreeSet<String> = topics.iter().map(|t| t.to_string()).collect();
            handle.group.add_member(
                GroupMember {
                    consumer_id: consumer_id.to_string(),
                    topics: topics.into_iter().collect(),
                    prefetch,
                    heartbeat: Heartbeat::new(self.config.session_timeout(), now),
                },
                options.mode,
            )?;
            members.insert(consumer_id.to_string(), group_id.to_string());
        }
        self.evicted.write().remove(consumer_id);

        log::info!("Consumer {} joined group {}", consumer_id, group_id);
        handle.rebalance(store, now, self.config.rebalance_timeout(), Some(consumer_id));
        Ok(handle.assignment(consumer_id, self.config.heartbeat_interval()))
    }

    fn check_not_elsewhere(
        consumer_id: &str,
        group_id: &str,
        members: &HashMap<String, String>,
    ) -> Result<()> {
        match members.get(consumer_id) {
            Some(current) if current != group_id => Err(BrokerError::InvalidArgument(format!(
                "consumer {} already belongs to group {}",
                consumer_id, current
            ))),
            _ => Ok(()),
        }
    }

    /// Acknowledges the assignment of `generation`.
    pub fn sync(&self, consumer_id: &str, generation: u32) -> Result<Assignment> {
        let (_, handle) = self.group_of(consumer_id)?;
        let mut handle = handle.lock();
        handle.group.sync(consumer_id, generation)?;
        Ok(handle.assignment(consumer_id, self.config.heartbeat_interval()))
    }

    /// Current assignment of `consumer_id`, acknowledged or not.
    pub fn assignment(&self, consumer_id: &str) -> Result<Assignment> {
        let (_, handle) = self.group_of(consumer_id)?;
        let handle = handle.lock();
        Ok(handle.assignment(consumer_id, self.config.heartbeat_interval()))
    }

    pub fn heartbeat(&self, consumer_id: &str, now: Instant) -> Result<HeartbeatStatus> {
        let (_, handle) = self.group_of(consumer_id)?;
        let mut handle = handle.lock();
        handle.group.heartbeat(consumer_id, now)
    }

    /// Graceful leave. The consumer's in-flight messages are released and the
    /// remaining members rebalance.
    pub fn leave(&self, consumer_id: &str, store: &MessageStore, now: Instant) -> Result<()> {
        let (group_id, handle) = self.group_of(consumer_id)?;
        let mut handle = handle.lock();
        handle.group.remove_member(consumer_id);
        handle.delivery.release_consumer(consumer_id);
        self.members.write().remove(consumer_id);
        log::info!("Consumer {} left group {}", consumer_id, group_id);
        handle.rebalance(store, now, self.config.rebalance_timeout(), None);
        Ok(())
    }

    /// Evicts members that missed their session deadline or let the
    /// rebalance grace period lapse, then expires overdue deliveries.
    pub fn maintain(&self, store: &MessageStore, now: Instant) -> CoordinatorReport {
        let mut report = CoordinatorReport::default();
        let handles: Vec<Arc<Mutex<GroupHandle>>> = self.groups.read().values().cloned().collect();

        for handle in handles {
            let mut handle = handle.lock();
            let mut doomed: BTreeSet<String> = handle.group.expired_members(now).into_iter().collect();
            doomed.extend(handle.group.unsynced_after_grace(now));

            if !doomed.is_empty() {
                for consumer_id in &doomed {
                    handle.group.remove_member(consumer_id);
                    handle.delivery.release_consumer(consumer_id);
                    self.members.write().remove(consumer_id);
                    self.evicted.write().insert(consumer_id.clone(), now);
                    log::warn!(
                        "Evicted consumer {} from group {}",
                        consumer_id,
                        handle.group.group_id
                    );
                }
                handle.rebalance(store, now, self.config.rebalance_timeout(), None);
                report.evicted.extend(doomed);
            }

            report.redelivered += handle.delivery.expire(now);
        }

        let session_timeout = self.config.session_timeout();
        self.evicted
            .write()
            .retain(|_, at| now.saturating_duration_since(*at) < session_timeout);
        report
    }

    /// `group -> consumer -> last heartbeat` in unix milliseconds.
    pub fn membership(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        let handles: Vec<Arc<Mutex<GroupHandle>>> = self.groups.read().values().cloned().collect();
        let mut table = BTreeMap::new();
        for handle in handles {
            let handle = handle.lock();
            let members: BTreeMap<String, u64> = handle
                .group
                .members()
                .iter()
                .map(|m| {
                    let millis = m
                        .heartbeat
                        .last_beat_wall
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    (m.consumer_id.clone(), millis)
                })
                .collect();
            table.insert(handle.group.group_id.clone(), members);
        }
        table
    }
}
