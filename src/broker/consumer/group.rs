use crate::broker::consumer::assignor::assign;
use crate::broker::consumer::heartbeat::Heartbeat;
use crate::broker::error::{BrokerError, Result};
use crate::message::record::TopicPartition;
use crate::subscriber::types::{GroupMode, HeartbeatStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Partition count of every topic the group's members subscribe to.
pub type TopicLayout = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// No members. Committed cursors survive this state.
    Empty,
    Stable,
    /// A new assignment has been published and not every member has
    /// acknowledged it. Pulls are paused.
    Rebalancing,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Empty => "empty",
            GroupState::Stable => "stable",
            GroupState::Rebalancing => "rebalancing",
        }
    }
}

/// Represents a member of a consumer group.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub consumer_id: String,
    pub topics: Vec<String>,
    pub prefetch: usize,
    pub heartbeat: Heartbeat,
}

/// Represents a consumer group.
#[derive(Debug)]
pub struct ConsumerGroup {
    pub group_id: String,
    pub state: GroupState,
    pub generation: u32,
    pub mode: GroupMode,
    /// In join order; the assignor relies on this order.
    members: Vec<GroupMember>,
    assignment: BTreeMap<String, Vec<TopicPartition>>,
    /// Members that have not acknowledged the current generation.
    pending: BTreeSet<String>,
    rebalance_deadline: Option<Instant>,
}

impl ConsumerGroup {
    /// Creates a new, empty consumer group.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::consumer::group::{ConsumerGroup, GroupState};
    ///
    /// let group = ConsumerGroup::new("group1");
    /// assert_eq!(group.group_id, "group1");
    /// assert_eq!(group.state, GroupState::Empty);
    /// ```
    pub fn new(group_id: &str) -> Self {
        ConsumerGroup {
            group_id: group_id.to_string(),
            state: GroupState::Empty,
            generation: 0,
            mode: GroupMode::default(),
            members: Vec::new(),
            assignment: BTreeMap::new(),
            pending: BTreeSet::new(),
            rebalance_deadline: None,
        }
    }

    /// Adds (or refreshes) a member. The caller must follow up with
    /// [`ConsumerGroup::rebalance`].
    pub fn add_member(&mut self, member: GroupMember, mode: GroupMode) -> Result<()> {
        if self.members.is_empty() {
            self.mode = mode;
        } else if self.mode != mode {
            return Err(BrokerError::InvalidArgument(format!(
                "group {} is {:?}, cannot join as {:?}",
                self.group_id, self.mode, mode
            )));
        }

        match self
            .members
            .iter_mut()
            .find(|m| m.consumer_id == member.consumer_id)
        {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
        Ok(())
    }

    pub fn remove_member(&mut self, consumer_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.consumer_id != consumer_id);
        self.assignment.remove(consumer_id);
        self.pending.remove(consumer_id);
        self.members.len() != before
    }

    pub fn member(&self, consumer_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.consumer_id == consumer_id)
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn is_member(&self, consumer_id: &str) -> bool {
        self.member(consumer_id).is_some()
    }

    /// Union of the members' topics.
    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .flat_map(|m| m.topics.iter().cloned())
            .collect()
    }

    fn compute_assignment(&self, layout: &TopicLayout) -> BTreeMap<String, Vec<TopicPartition>> {
        let mut assignment: BTreeMap<String, Vec<TopicPartition>> = self
            .members
            .iter()
            .map(|m| (m.consumer_id.clone(), Vec::new()))
            .collect();

        for (topic, count) in layout {
            let partitions: Vec<TopicPartition> =
                (0..*count).map(|p| TopicPartition::new(topic, p)).collect();
            let subscribers: Vec<String> = self
                .members
                .iter()
                .filter(|m| m.topics.contains(topic))
                .map(|m| m.consumer_id.clone())
                .collect();

            match self.mode {
                GroupMode::Partitioned => {
                    for (consumer, owned) in assign(&partitions, &subscribers) {
                        assignment.entry(consumer).or_default().extend(owned);
                    }
                }
                GroupMode::Shared => {
                    for consumer in subscribers {
                        assignment
                            .entry(consumer)
                            .or_default()
                            .extend(partitions.iter().cloned());
                    }
                }
            }
        }
        assignment
    }

    /// Publishes a fresh assignment for the current membership.
    ///
    /// `acknowledged` is a member that already has the new assignment in
    /// hand (the joiner). With no members the group becomes `Empty`.
    pub fn rebalance(
        &mut self,
        layout: &TopicLayout,
        now: Instant,
        grace: std::time::Duration,
        acknowledged: Option<&str>,
    ) {
        if self.members.is_empty() {
            self.state = GroupState::Empty;
            self.assignment.clear();
            self.pending.clear();
            self.rebalance_deadline = None;
            log::info!("Group {} is empty", self.group_id);
            return;
        }

        let previous = self.state;
        self.generation += 1;
        self.assignment = self.compute_assignment(layout);
        self.pending = self
            .members
            .iter()
            .map(|m| m.consumer_id.clone())
            .filter(|id| Some(id.as_str()) != acknowledged)
            .collect();
        self.state = GroupState::Rebalancing;
        self.rebalance_deadline = Some(now + grace);
        log::info!(
            "Group {} {} -> rebalancing at generation {} with {} members",
            self.group_id,
            previous.as_str(),
            self.generation,
            self.members.len()
        );
        self.complete_if_synced();
    }

    fn complete_if_synced(&mut self) {
        if self.state == GroupState::Rebalancing && self.pending.is_empty() {
            self.state = GroupState::Stable;
            self.rebalance_deadline = None;
            log::info!(
                "Group {} stable at generation {}",
                self.group_id,
                self.generation
            );
        }
    }

    /// A member acknowledges the assignment of `generation`.
    pub fn sync(&mut self, consumer_id: &str, generation: u32) -> Result<Vec<TopicPartition>> {
        if !self.is_member(consumer_id) {
            return Err(BrokerError::ConsumerNotFound(consumer_id.to_string()));
        }
        if generation != self.generation {
            return Err(BrokerError::StaleGeneration {
                group: self.group_id.clone(),
                given: generation,
                current: self.generation,
            });
        }
        self.pending.remove(consumer_id);
        self.complete_if_synced();
        Ok(self.assignment_of(consumer_id).to_vec())
    }

    pub fn heartbeat(&mut self, consumer_id: &str, now: Instant) -> Result<HeartbeatStatus> {
        let generation = self.generation;
        let awaiting_sync = self.pending.contains(consumer_id);
        let member = self
            .members
            .iter_mut()
            .find(|m| m.consumer_id == consumer_id)
            .ok_or_else(|| BrokerError::Evicted(consumer_id.to_string()))?;
        member.heartbeat.beat(now);

        Ok(if awaiting_sync {
            HeartbeatStatus::Rebalancing { generation }
        } else {
            HeartbeatStatus::Stable { generation }
        })
    }

    /// Members whose session timed out.
    pub fn expired_members(&self, now: Instant) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.heartbeat.check_timeout(now))
            .map(|m| m.consumer_id.clone())
            .collect()
    }

    /// Members that let the rebalance grace period lapse without syncing.
    pub fn unsynced_after_grace(&self, now: Instant) -> Vec<String> {
        match (self.state, self.rebalance_deadline) {
            (GroupState::Rebalancing, Some(deadline)) if now > deadline => {
                self.pending.iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn assignment_of(&self, consumer_id: &str) -> &[TopicPartition] {
        self.assignment
            .get(consumer_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn owns(&self, consumer_id: &str, tp: &TopicPartition) -> bool {
        self.assignment_of(consumer_id).contains(tp)
    }

    /// Every partition some member currently owns.
    pub fn assigned_partitions(&self) -> BTreeSet<TopicPartition> {
        self.assignment.values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const GRACE: Duration = Duration::from_secs(5);

    fn member(id: &str, topics: &[&str], now: Instant) -> GroupMember {
        GroupMember {
            consumer_id: id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            prefetch: 1,
            heartbeat: Heartbeat::new(Duration::from_secs(10), now),
        }
    }

    fn layout(topics: &[(&str, u32)]) -> TopicLayout {
        topics.iter().map(|(t, n)| (t.to_string(), *n)).collect()
    }

    fn join(group: &mut ConsumerGroup, id: &str, topics: &[&str], now: Instant, l: &TopicLayout) {
        group
            .add_member(member(id, topics, now), GroupMode::Partitioned)
            .unwrap();
        group.rebalance(l, now, GRACE, Some(id));
    }

    #[test]
    fn test_first_join_is_immediately_stable() {
        let now = Instant::now();
        let l = layout(&[("orders", 4)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);

        assert_eq!(group.state, GroupState::Stable);
        assert_eq!(group.generation, 1);
        assert_eq!(group.assignment_of("c1").len(), 4);
    }

    #[test]
    fn test_second_join_waits_for_existing_member() {
        let now = Instant::now();
        let l = layout(&[("orders", 4)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);
        assert_eq!(group.state.as_str(), "stable");
        join(&mut group, "c2", &["orders"], now, &l);

        assert_eq!(group.state, GroupState::Rebalancing);
        assert_eq!(group.state.as_str(), "rebalancing");
        assert_eq!(
            group.heartbeat("c1", now).unwrap(),
            HeartbeatStatus::Rebalancing { generation: 2 }
        );
        assert_eq!(
            group.heartbeat("c2", now).unwrap(),
            HeartbeatStatus::Stable { generation: 2 }
        );

        let owned = group.sync("c1", 2).unwrap();
        assert_eq!(owned, vec![TopicPartition::new("orders", 0), TopicPartition::new("orders", 1)]);
        assert_eq!(group.state, GroupState::Stable);
        assert_eq!(group.assignment_of("c2").len(), 2);
    }

    #[test]
    fn test_sync_with_stale_generation() {
        let now = Instant::now();
        let l = layout(&[("orders", 2)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);
        join(&mut group, "c2", &["orders"], now, &l);
        assert!(matches!(
            group.sync("c1", 1),
            Err(BrokerError::StaleGeneration { given: 1, current: 2, .. })
        ));
    }

    #[test]
    fn test_unsynced_members_reported_after_grace() {
        let now = Instant::now();
        let l = layout(&[("orders", 2)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);
        join(&mut group, "c2", &["orders"], now, &l);

        assert!(group.unsynced_after_grace(now + Duration::from_secs(1)).is_empty());
        assert_eq!(
            group.unsynced_after_grace(now + Duration::from_secs(6)),
            vec!["c1".to_string()]
        );
    }

    #[test]
    fn test_members_only_get_subscribed_topics() {
        let now = Instant::now();
        let l = layout(&[("a", 2), ("b", 1)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["a"], now, &l);
        join(&mut group, "c2", &["a", "b"], now, &l);
        group.sync("c1", 2).unwrap();

        assert_eq!(group.assignment_of("c1"), &[TopicPartition::new("a", 0)]);
        assert_eq!(
            group.assignment_of("c2"),
            &[TopicPartition::new("a", 1), TopicPartition::new("b", 0)]
        );
    }

    #[test]
    fn test_shared_mode_gives_everyone_every_partition() {
        let now = Instant::now();
        let l = layout(&[("work", 1)]);
        let mut group = ConsumerGroup::new("g");
        group
            .add_member(member("c1", &["work"], now), GroupMode::Shared)
            .unwrap();
        group.rebalance(&l, now, GRACE, Some("c1"));
        group
            .add_member(member("c2", &["work"], now), GroupMode::Shared)
            .unwrap();
        group.rebalance(&l, now, GRACE, Some("c2"));

        assert!(group.owns("c1", &TopicPartition::new("work", 0)));
        assert!(group.owns("c2", &TopicPartition::new("work", 0)));
    }

    #[test]
    fn test_mode_is_fixed_by_first_member() {
        let now = Instant::now();
        let mut group = ConsumerGroup::new("g");
        group
            .add_member(member("c1", &["t"], now), GroupMode::Shared)
            .unwrap();
        let result = group.add_member(member("c2", &["t"], now), GroupMode::Partitioned);
        assert!(matches!(result, Err(BrokerError::InvalidArgument(_))));
    }

    #[test]
    fn test_last_member_leaving_empties_group() {
        let now = Instant::now();
        let l = layout(&[("orders", 2)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);

        assert!(group.remove_member("c1"));
        group.rebalance(&l, now, GRACE, None);
        assert_eq!(group.state, GroupState::Empty);
        assert!(group.assigned_partitions().is_empty());
    }

    #[test]
    fn test_expired_members() {
        let now = Instant::now();
        let l = layout(&[("orders", 2)]);
        let mut group = ConsumerGroup::new("g");
        join(&mut group, "c1", &["orders"], now, &l);
        join(&mut group, "c2", &["orders"], now, &l);
        group.heartbeat("c2", now + Duration::from_secs(8)).unwrap();

        let expired = group.expired_members(now + Duration::from_secs(11));
        assert_eq!(expired, vec!["c1".to_string()]);
    }

    #[test]
    fn test_heartbeat_from_non_member_is_evicted() {
        let mut group = ConsumerGroup::new("g");
        assert!(matches!(
            group.heartbeat("ghost", Instant::now()),
            Err(BrokerError::Evicted(_))
        ));
    }
}
