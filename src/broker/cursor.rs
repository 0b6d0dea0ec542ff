use crate::message::record::TopicPartition;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Group read position on one partition.
///
/// Stored as the next offset to consume: every offset below `position()` is
/// committed. Updates are a monotonic max, so late or reordered acks can
/// never move the cursor backwards.
#[derive(Debug, Default)]
pub struct CommitCursor {
    next: AtomicU64,
}

impl CommitCursor {
    pub fn new(position: u64) -> Self {
        CommitCursor {
            next: AtomicU64::new(position),
        }
    }

    pub fn position(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Highest committed offset, if any.
    pub fn committed(&self) -> Option<u64> {
        self.position().checked_sub(1)
    }

    /// Compare-and-advance. Returns true if the cursor moved.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_broker_core::broker::cursor::CommitCursor;
    ///
    /// let cursor = CommitCursor::new(0);
    /// assert!(cursor.advance_to(5));
    /// assert!(!cursor.advance_to(3));
    /// assert_eq!(cursor.committed(), Some(4));
    /// ```
    pub fn advance_to(&self, position: u64) -> bool {
        self.next.fetch_max(position, Ordering::AcqRel) < position
    }
}

/// `group -> topic -> partition -> position`, the persisted form.
pub type CursorSnapshot = BTreeMap<String, BTreeMap<String, BTreeMap<u32, u64>>>;

/// Durable cursors keyed by `(group, partition)`. Cursors outlive group
/// membership.
#[derive(Debug, Default)]
pub struct CursorTable {
    cursors: RwLock<HashMap<String, HashMap<TopicPartition, Arc<CommitCursor>>>>,
}

impl CursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cursor for `(group, tp)`, created at `initial()` if missing.
    pub fn cursor<F: FnOnce() -> u64>(&self, group: &str, tp: &TopicPartition, initial: F) -> Arc<CommitCursor> {
        if let Some(cursor) = self.cursors.read().get(group).and_then(|g| g.get(tp)) {
            return Arc::clone(cursor);
        }
        let mut cursors = self.cursors.write();
        Arc::clone(
            cursors
                .entry(group.to_string())
                .or_default()
                .entry(tp.clone())
                .or_insert_with(|| Arc::new(CommitCursor::new(initial()))),
        )
    }

    pub fn get(&self, group: &str, tp: &TopicPartition) -> Option<Arc<CommitCursor>> {
        self.cursors
            .read()
            .get(group)
            .and_then(|g| g.get(tp))
            .cloned()
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        let mut out = CursorSnapshot::new();
        for (group, cursors) in self.cursors.read().iter() {
            let topics = out.entry(group.clone()).or_default();
            for (tp, cursor) in cursors {
                topics
                    .entry(tp.topic.clone())
                    .or_default()
                    .insert(tp.partition, cursor.position());
            }
        }
        out
    }

    pub fn restore(&self, snapshot: &CursorSnapshot) {
        let mut cursors = self.cursors.write();
        for (group, topics) in snapshot {
            let group_cursors = cursors.entry(group.clone()).or_default();
            for (topic, partitions) in topics {
                for (partition, position) in partitions {
                    let cursor = group_cursors
                        .entry(TopicPartition::new(topic, *partition))
                        .or_insert_with(|| Arc::new(CommitCursor::new(0)));
                    cursor.advance_to(*position);
                }
            }
        }
    }
}
