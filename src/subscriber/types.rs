use crate::message::record::{Message, TopicPartition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How a consumer group shares the partitions of its topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Each partition has exactly one owner; members beyond the partition
    /// count sit idle.
    #[default]
    Partitioned,
    /// Every member may pull from every partition; prefetch limits decide
    /// who gets the next message.
    Shared,
}

/// Options a consumer passes when joining a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Maximum unacknowledged deliveries; `None` uses the broker default.
    pub prefetch: Option<usize>,
    pub mode: GroupMode,
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn shared(mut self) -> Self {
        self.mode = GroupMode::Shared;
        self
    }
}

/// The partitions a member may pull from, as of `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub group_id: String,
    pub generation: u32,
    pub partitions: Vec<TopicPartition>,
    /// How often the member is expected to heartbeat.
    pub heartbeat_interval: Duration,
}

impl Assignment {
    pub fn is_idle(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// One message handed to a consumer by `poll`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: TopicPartition,
    pub message: Arc<Message>,
    /// 1 on first delivery, higher on redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn offset(&self) -> u64 {
        self.message.offset
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.value
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Stable { generation: u32 },
    /// A new assignment is waiting; call `sync` with this generation.
    Rebalancing { generation: u32 },
}
