//! In-flight tracking and acknowledgment for one consumer group.
//!
//! Every partition the group reads has a [`PartitionDelivery`]:
//! - `next_fetch` - lowest offset never delivered to this group
//! - `in_flight` - delivered, awaiting ack, with a deadline
//! - `redeliver` - released by nack, ack timeout or rebalance
//! - `acked` - settled individually above the commit cursor
//!
//! The commit cursor only moves over a contiguous run of settled offsets,
//! so it never skips an outstanding message.

use crate::broker::cursor::{CommitCursor, CursorTable};
use crate::broker::error::{BrokerError, Result};
use crate::broker::store::MessageStore;
use crate::message::ack::AckMode;
use crate::message::record::{Message, TopicPartition};
use crate::subscriber::types::Delivery;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct InFlight {
    consumer: String,
    deadline: Instant,
}

#[derive(Debug)]
struct PartitionDelivery {
    cursor: Arc<CommitCursor>,
    next_fetch: u64,
    in_flight: BTreeMap<u64, InFlight>,
    redeliver: BTreeSet<u64>,
    acked: BTreeSet<u64>,
    attempts: HashMap<u64, u32>,
}

impl PartitionDelivery {
    fn new(cursor: Arc<CommitCursor>) -> Self {
        let next_fetch = cursor.position();
        PartitionDelivery {
            cursor,
            next_fetch,
            in_flight: BTreeMap::new(),
            redeliver: BTreeSet::new(),
            acked: BTreeSet::new(),
            attempts: HashMap::new(),
        }
    }

    /// Moves the cursor over settled offsets and forgets their bookkeeping.
    fn advance(&mut self) {
        let mut next = self.cursor.position();
        while self.acked.remove(&next) {
            next += 1;
        }
        self.cursor.advance_to(next);
        let position = self.cursor.position();
        self.next_fetch = self.next_fetch.max(position);
        self.attempts.retain(|offset, _| *offset >= position);
    }

    fn is_settled(&self, offset: u64) -> bool {
        offset < self.cursor.position() || self.acked.contains(&offset)
    }
}

/// What a pull produced besides deliveries.
#[derive(Debug, Default)]
pub struct PullResult {
    pub deliveries: Vec<Delivery>,
    /// Messages that exceeded the delivery attempt limit and were settled.
    pub dead_lettered: Vec<(TopicPartition, Arc<Message>)>,
}

#[derive(Debug)]
pub struct DeliveryManager {
    group_id: String,
    partitions: HashMap<TopicPartition, PartitionDelivery>,
    /// In-flight count per consumer, checked against its prefetch limit.
    outstanding: HashMap<String, usize>,
    /// Per-consumer start index so pulls rotate over owned partitions.
    rotation: HashMap<String, usize>,
    ack_timeout: Duration,
    max_attempts: Option<u32>,
}

impl DeliveryManager {
    pub fn new(group_id: &str, ack_timeout: Duration, max_attempts: Option<u32>) -> Self {
        DeliveryManager {
            group_id: group_id.to_string(),
            partitions: HashMap::new(),
            outstanding: HashMap::new(),
            rotation: HashMap::new(),
            ack_timeout,
            max_attempts,
        }
    }

    fn state_mut(
        &mut self,
        tp: &TopicPartition,
        cursors: &CursorTable,
        store: &MessageStore,
    ) -> Result<&mut PartitionDelivery> {
        if !self.partitions.contains_key(tp) {
            let (log_start, _) = store.bounds(tp)?;
            let cursor = cursors.cursor(&self.group_id, tp, || log_start);
            self.partitions.insert(tp.clone(), PartitionDelivery::new(cursor));
        }
        self.partitions
            .get_mut(tp)
            .ok_or_else(|| BrokerError::PartitionNotAssigned {
                consumer: self.group_id.clone(),
                partition: tp.clone(),
            })
    }

    fn release_entry(outstanding: &mut HashMap<String, usize>, holder: &str) {
        if let Some(count) = outstanding.get_mut(holder) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn outstanding(&self, consumer: &str) -> usize {
        self.outstanding.get(consumer).copied().unwrap_or(0)
    }

    pub fn in_flight(&self, tp: &TopicPartition) -> Vec<u64> {
        self.partitions
            .get(tp)
            .map(|p| p.in_flight.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_redelivery(&self, tp: &TopicPartition) -> Vec<u64> {
        self.partitions
            .get(tp)
            .map(|p| p.redeliver.iter().copied().collect())
            .unwrap_or_default()
    }

    /// If the cursor of `tp` fell below the retention floor, fast-forward it
    /// and report the gap once.
    fn check_retention_floor(
        &mut self,
        tp: &TopicPartition,
        cursors: &CursorTable,
        store: &MessageStore,
    ) -> Result<()> {
        let (log_start, log_end) = store.bounds(tp)?;
        let state = self.state_mut(tp, cursors, store)?;
        let position = state.cursor.position();
        if position >= log_start {
            return Ok(());
        }

        let lost: Vec<(u64, InFlight)> = state
            .in_flight
            .range(..log_start)
            .map(|(o, f)| (*o, f.clone()))
            .collect();
        for (offset, _) in &lost {
            state.in_flight.remove(offset);
        }
        state.redeliver = state.redeliver.split_off(&log_start);
        state.acked = state.acked.split_off(&log_start);
        state.cursor.advance_to(log_start);
        state.advance();
        for (_, entry) in &lost {
            Self::release_entry(&mut self.outstanding, &entry.consumer);
        }

        log::warn!(
            "Group {} cursor on {} was at {} below retention floor {}, reset",
            self.group_id,
            tp,
            position,
            log_start
        );
        Err(BrokerError::OffsetOutOfRange {
            partition: tp.clone(),
            requested: position,
            log_start,
            log_end,
        })
    }

    /// Next message of `tp` for `consumer`: the lowest released offset first,
    /// then the log head.
    fn next_for(
        &mut self,
        consumer: &str,
        tp: &TopicPartition,
        cursors: &CursorTable,
        store: &MessageStore,
        now: Instant,
        dead_lettered: &mut Vec<(TopicPartition, Arc<Message>)>,
    ) -> Result<Option<Delivery>> {
        let ack_timeout = self.ack_timeout;
        let max_attempts = self.max_attempts;
        let state = self.state_mut(tp, cursors, store)?;
        state.next_fetch = state.next_fetch.max(state.cursor.position());

        loop {
            let (offset, from_pool) = match state.redeliver.first() {
                Some(offset) => (*offset, true),
                None => (state.next_fetch, false),
            };
            // A restored cursor may sit past the end of a fresh log.
            if offset >= store.bounds(tp)?.1 {
                return Ok(None);
            }
            let Some(message) = store.read_one(tp, offset)? else {
                return Ok(None);
            };
            if from_pool {
                state.redeliver.remove(&offset);
            } else {
                state.next_fetch = offset + 1;
            }

            let attempt = state.attempts.entry(offset).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;

            if max_attempts.is_some_and(|max| attempt > max) {
                log::warn!(
                    "Message {}@{} exceeded {} delivery attempts, dead lettering",
                    tp,
                    offset,
                    attempt - 1
                );
                state.acked.insert(offset);
                state.advance();
                dead_lettered.push((tp.clone(), message));
                continue;
            }

            state.in_flight.insert(
                offset,
                InFlight {
                    consumer: consumer.to_string(),
                    deadline: now + ack_timeout,
                },
            );
            *self.outstanding.entry(consumer.to_string()).or_insert(0) += 1;
            return Ok(Some(Delivery {
                partition: tp.clone(),
                message,
                attempt,
            }));
        }
    }

    /// Pulls up to `max` messages for `consumer` from `owned`, within its
    /// prefetch limit. Partitions are visited round-robin, one message per
    /// partition per round.
    #[allow(clippy::too_many_arguments)]
    pub fn pull(
        &mut self,
        consumer: &str,
        owned: &[TopicPartition],
        prefetch: usize,
        max: usize,
        cursors: &CursorTable,
        store: &MessageStore,
        now: Instant,
    ) -> Result<PullResult> {
        let mut result = PullResult::default();
        let budget = prefetch.saturating_sub(self.outstanding(consumer)).min(max);
        if budget == 0 || owned.is_empty() {
            return Ok(result);
        }

        for tp in owned {
            self.check_retention_floor(tp, cursors, store)?;
        }

        let start = {
            let rotation = self.rotation.entry(consumer.to_string()).or_insert(0);
            let start = *rotation % owned.len();
            *rotation = rotation.wrapping_add(1);
            start
        };

        'rounds: loop {
            let mut progressed = false;
            for i in 0..owned.len() {
                if result.deliveries.len() >= budget {
                    break 'rounds;
                }
                let tp = &owned[(start + i) % owned.len()];
                if let Some(delivery) =
                    self.next_for(consumer, tp, cursors, store, now, &mut result.dead_lettered)?
                {
                    result.deliveries.push(delivery);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(result)
    }

    /// Settles `offset` (and, cumulatively, what precedes it).
    ///
    /// `exclusive` means the acking consumer is the partition's only reader;
    /// a cumulative ack then settles everything up to `offset`. Otherwise a
    /// cumulative ack only covers the consumer's own deliveries.
    pub fn ack(
        &mut self,
        consumer: &str,
        tp: &TopicPartition,
        offset: u64,
        mode: AckMode,
        exclusive: bool,
    ) -> Result<()> {
        let Some(state) = self.partitions.get_mut(tp) else {
            return Err(BrokerError::OffsetOutOfRange {
                partition: tp.clone(),
                requested: offset,
                log_start: 0,
                log_end: 0,
            });
        };
        if state.is_settled(offset) {
            return Ok(());
        }
        if offset >= state.next_fetch {
            return Err(BrokerError::OffsetOutOfRange {
                partition: tp.clone(),
                requested: offset,
                log_start: state.cursor.position(),
                log_end: state.next_fetch,
            });
        }

        let settled: Vec<u64> = match (mode, exclusive) {
            (AckMode::Individual, true) => vec![offset],
            // A competitor's in-flight message is not ours to settle.
            (AckMode::Individual, false) => match state.in_flight.get(&offset) {
                Some(held) if held.consumer != consumer => {
                    log::debug!(
                        "Consumer {} acked {}@{} held by {}, ignored",
                        consumer,
                        tp,
                        offset,
                        held.consumer
                    );
                    return Ok(());
                }
                _ => vec![offset],
            },
            (AckMode::Cumulative, false) => state
                .in_flight
                .range(..=offset)
                .filter(|(_, f)| f.consumer == consumer)
                .map(|(o, _)| *o)
                .collect(),
            (AckMode::Cumulative, true) => {
                let released: Vec<String> = state
                    .in_flight
                    .range(..=offset)
                    .map(|(_, f)| f.consumer.clone())
                    .collect();
                state.in_flight = state.in_flight.split_off(&(offset + 1));
                state.redeliver = state.redeliver.split_off(&(offset + 1));
                state.acked = state.acked.split_off(&(offset + 1));
                state.cursor.advance_to(offset + 1);
                state.advance();
                for holder in &released {
                    Self::release_entry(&mut self.outstanding, holder);
                }
                return Ok(());
            }
        };

        for offset in settled {
            if let Some(entry) = state.in_flight.remove(&offset) {
                Self::release_entry(&mut self.outstanding, &entry.consumer);
            }
            state.redeliver.remove(&offset);
            state.acked.insert(offset);
        }
        state.advance();
        Ok(())
    }

    /// Returns `offset` to the redelivery pool if `consumer` holds it.
    pub fn nack(&mut self, consumer: &str, tp: &TopicPartition, offset: u64) -> Result<()> {
        let Some(state) = self.partitions.get_mut(tp) else {
            return Ok(());
        };
        if state.is_settled(offset) {
            return Ok(());
        }
        if offset >= state.next_fetch {
            return Err(BrokerError::OffsetOutOfRange {
                partition: tp.clone(),
                requested: offset,
                log_start: state.cursor.position(),
                log_end: state.next_fetch,
            });
        }

        let held = state
            .in_flight
            .get(&offset)
            .is_some_and(|f| f.consumer == consumer);
        if held {
            state.in_flight.remove(&offset);
            state.redeliver.insert(offset);
            Self::release_entry(&mut self.outstanding, consumer);
            log::debug!("Consumer {} nacked {}@{}, requeued", consumer, tp, offset);
        }
        Ok(())
    }

    /// Releases every delivery whose ack deadline passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for (tp, state) in self.partitions.iter_mut() {
            let late: Vec<(u64, String)> = state
                .in_flight
                .iter()
                .filter(|(_, f)| now > f.deadline)
                .map(|(o, f)| (*o, f.consumer.clone()))
                .collect();
            for (offset, holder) in late {
                state.in_flight.remove(&offset);
                state.redeliver.insert(offset);
                Self::release_entry(&mut self.outstanding, &holder);
                log::warn!(
                    "Ack deadline missed by {} for {}@{}, requeued",
                    holder,
                    tp,
                    offset
                );
                expired += 1;
            }
        }
        expired
    }

    /// Releases everything `consumer` holds.
    pub fn release_consumer(&mut self, consumer: &str) -> usize {
        let mut released = 0;
        for state in self.partitions.values_mut() {
            let held: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, f)| f.consumer == consumer)
                .map(|(o, _)| *o)
                .collect();
            for offset in held {
                state.in_flight.remove(&offset);
                state.redeliver.insert(offset);
                released += 1;
            }
        }
        self.outstanding.remove(consumer);
        self.rotation.remove(consumer);
        released
    }

    /// Drains all in-flight tracking into the redelivery pools. Run while a
    /// rebalance holds the group, before the new assignment is served.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for state in self.partitions.values_mut() {
            let offsets: Vec<u64> = state.in_flight.keys().copied().collect();
            released += offsets.len();
            state.redeliver.extend(offsets);
            state.in_flight.clear();
        }
        self.outstanding.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::config::RetentionPolicy;
    use std::collections::BTreeMap as Headers;
    use std::time::SystemTime;

    struct Fixture {
        store: MessageStore,
        cursors: CursorTable,
        delivery: DeliveryManager,
        tp: TopicPartition,
        now: Instant,
    }

    fn fixture(messages: usize) -> Fixture {
        let store = MessageStore::new();
        store.create_topic("t", 1, RetentionPolicy::default()).unwrap();
        for i in 0..messages {
            store
                .append("t", 0, None, format!("m{}", i).into_bytes(), Headers::new())
                .unwrap();
        }
        Fixture {
            store,
            cursors: CursorTable::new(),
            delivery: DeliveryManager::new("g", Duration::from_secs(30), None),
            tp: TopicPartition::new("t", 0),
            now: Instant::now(),
        }
    }

    impl Fixture {
        fn pull(&mut self, consumer: &str, prefetch: usize) -> Vec<u64> {
            self.pull_at(consumer, prefetch, self.now)
        }

        fn pull_at(&mut self, consumer: &str, prefetch: usize, now: Instant) -> Vec<u64> {
            let owned = vec![self.tp.clone()];
            self.delivery
                .pull(consumer, &owned, prefetch, usize::MAX, &self.cursors, &self.store, now)
                .unwrap()
                .deliveries
                .iter()
                .map(Delivery::offset)
                .collect()
        }

        fn committed(&self) -> Option<u64> {
            self.cursors.get("g", &self.tp).and_then(|c| c.committed())
        }
    }

    #[test]
    fn test_prefetch_limits_pull() {
        let mut f = fixture(5);
        assert_eq!(f.pull("a", 2), vec![0, 1]);
        assert!(f.pull("a", 2).is_empty());
        assert_eq!(f.delivery.outstanding("a"), 2);
    }

    #[test]
    fn test_cumulative_ack_commits_prefix() {
        let mut f = fixture(5);
        assert_eq!(f.pull("a", 5), vec![0, 1, 2, 3, 4]);
        f.delivery.ack("a", &f.tp, 2, AckMode::Cumulative, true).unwrap();
        assert_eq!(f.committed(), Some(2));
        assert_eq!(f.delivery.in_flight(&f.tp), vec![3, 4]);
        assert_eq!(f.delivery.outstanding("a"), 2);

        // Re-acking is a no-op.
        f.delivery.ack("a", &f.tp, 2, AckMode::Cumulative, true).unwrap();
        f.delivery.ack("a", &f.tp, 1, AckMode::Cumulative, true).unwrap();
        assert_eq!(f.committed(), Some(2));
    }

    #[test]
    fn test_individual_ack_waits_for_gap() {
        let mut f = fixture(3);
        f.pull("a", 3);
        f.delivery.ack("a", &f.tp, 1, AckMode::Individual, true).unwrap();
        assert_eq!(f.committed(), None);
        f.delivery.ack("a", &f.tp, 2, AckMode::Individual, true).unwrap();
        assert_eq!(f.committed(), None);
        f.delivery.ack("a", &f.tp, 0, AckMode::Individual, true).unwrap();
        assert_eq!(f.committed(), Some(2));
        assert_eq!(f.delivery.outstanding("a"), 0);
    }

    #[test]
    fn test_ack_of_undelivered_offset() {
        let mut f = fixture(3);
        f.pull("a", 1);
        let result = f.delivery.ack("a", &f.tp, 2, AckMode::Cumulative, true);
        assert!(matches!(result, Err(BrokerError::OffsetOutOfRange { requested: 2, .. })));
    }

    #[test]
    fn test_nack_redelivers_before_new_messages() {
        let mut f = fixture(3);
        assert_eq!(f.pull("a", 2), vec![0, 1]);
        f.delivery.nack("a", &f.tp, 0).unwrap();
        assert_eq!(f.delivery.pending_redelivery(&f.tp), vec![0]);

        let owned = vec![f.tp.clone()];
        let result = f
            .delivery
            .pull("a", &owned, 2, 10, &f.cursors, &f.store, f.now)
            .unwrap();
        assert_eq!(result.deliveries.len(), 1);
        assert_eq!(result.deliveries[0].offset(), 0);
        assert_eq!(result.deliveries[0].attempt, 2);
    }

    #[test]
    fn test_nack_by_non_holder_is_ignored() {
        let mut f = fixture(2);
        f.pull("a", 1);
        f.delivery.nack("b", &f.tp, 0).unwrap();
        assert_eq!(f.delivery.in_flight(&f.tp), vec![0]);
    }

    #[test]
    fn test_deadline_expiry_requeues() {
        let mut f = fixture(2);
        f.pull("a", 1);
        assert_eq!(f.delivery.expire(f.now + Duration::from_secs(10)), 0);
        assert_eq!(f.delivery.expire(f.now + Duration::from_secs(31)), 1);
        assert_eq!(f.delivery.outstanding("a"), 0);
        assert_eq!(f.pull("b", 1), vec![0]);
    }

    #[test]
    fn test_shared_cumulative_ack_only_covers_own_deliveries() {
        let mut f = fixture(3);
        assert_eq!(f.pull("a", 1), vec![0]);
        assert_eq!(f.pull("b", 1), vec![1]);
        f.delivery.ack("b", &f.tp, 1, AckMode::Cumulative, false).unwrap();
        assert_eq!(f.committed(), None);
        assert_eq!(f.delivery.in_flight(&f.tp), vec![0]);

        f.delivery.ack("a", &f.tp, 0, AckMode::Cumulative, false).unwrap();
        assert_eq!(f.committed(), Some(1));
    }

    #[test]
    fn test_shared_individual_ack_of_competitor_delivery_is_ignored() {
        let mut f = fixture(2);
        assert_eq!(f.pull("a", 1), vec![0]);
        f.delivery.ack("b", &f.tp, 0, AckMode::Individual, false).unwrap();
        assert_eq!(f.committed(), None);
        assert_eq!(f.delivery.in_flight(&f.tp), vec![0]);
        assert_eq!(f.delivery.outstanding("a"), 1);

        // Once released, anyone may settle it.
        f.delivery.nack("a", &f.tp, 0).unwrap();
        f.delivery.ack("b", &f.tp, 0, AckMode::Individual, false).unwrap();
        assert_eq!(f.committed(), Some(0));
    }

    #[test]
    fn test_prefetch_fairness_in_shared_pull() {
        let mut f = fixture(4);
        assert_eq!(f.pull("a", 1), vec![0]);
        assert_eq!(f.pull("b", 1), vec![1]);
        // a is still busy with 0.
        assert!(f.pull("a", 1).is_empty());
        f.delivery.ack("b", &f.tp, 1, AckMode::Individual, false).unwrap();
        assert_eq!(f.pull("b", 1), vec![2]);
    }

    #[test]
    fn test_release_all_drains_in_flight() {
        let mut f = fixture(3);
        f.pull("a", 2);
        assert_eq!(f.delivery.release_all(), 2);
        assert_eq!(f.delivery.outstanding("a"), 0);
        assert_eq!(f.delivery.pending_redelivery(&f.tp), vec![0, 1]);
        assert_eq!(f.pull("b", 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_release_consumer() {
        let mut f = fixture(3);
        f.pull("a", 1);
        f.pull("b", 1);
        assert_eq!(f.delivery.release_consumer("a"), 1);
        assert_eq!(f.delivery.in_flight(&f.tp), vec![1]);
        assert_eq!(f.delivery.pending_redelivery(&f.tp), vec![0]);
    }

    #[test]
    fn test_max_attempts_dead_letters() {
        let mut f = fixture(2);
        f.delivery = DeliveryManager::new("g", Duration::from_secs(30), Some(2));
        let owned = vec![f.tp.clone()];

        for _ in 0..2 {
            assert_eq!(f.pull("a", 1), vec![0]);
            f.delivery.nack("a", &f.tp, 0).unwrap();
        }
        let result = f
            .delivery
            .pull("a", &owned, 1, 10, &f.cursors, &f.store, f.now)
            .unwrap();
        assert_eq!(result.dead_lettered.len(), 1);
        assert_eq!(result.dead_lettered[0].1.offset, 0);
        assert_eq!(result.deliveries[0].offset(), 1);
        assert_eq!(f.committed(), Some(0));
    }

    #[test]
    fn test_retention_floor_surfaces_once() {
        let store = MessageStore::new();
        let policy = RetentionPolicy {
            max_bytes: Some(1),
            segment_max_messages: 2,
            ..RetentionPolicy::default()
        };
        store.create_topic("t", 1, policy).unwrap();
        let tp = TopicPartition::new("t", 0);
        let cursors = CursorTable::new();
        let mut delivery = DeliveryManager::new("g", Duration::from_secs(30), None);
        let owned = vec![tp.clone()];

        store.append("t", 0, None, b"m0".to_vec(), Headers::new()).unwrap();
        delivery
            .pull("a", &owned, 1, 10, &cursors, &store, Instant::now())
            .unwrap();
        for i in 1..5 {
            store
                .append("t", 0, None, format!("m{}", i).into_bytes(), Headers::new())
                .unwrap();
        }
        store.enforce_retention(SystemTime::now());
        assert_eq!(store.bounds(&tp).unwrap().0, 4);

        let result = delivery.pull("a", &owned, 1, 10, &cursors, &store, Instant::now());
        assert!(matches!(
            result,
            Err(BrokerError::OffsetOutOfRange { requested: 0, log_start: 4, .. })
        ));
        assert_eq!(delivery.outstanding("a"), 0);

        let result = delivery
            .pull("a", &owned, 1, 10, &cursors, &store, Instant::now())
            .unwrap();
        assert_eq!(result.deliveries[0].offset(), 4);
    }
}
