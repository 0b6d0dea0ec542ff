//! Message broker core: partitioned append-only logs, exchange routing,
//! consumer groups with range assignment, and at-least-once delivery with
//! prefetch limits and committed cursors.

pub mod broker;
pub mod message;
pub mod subscriber;

pub use broker::Broker;
pub use broker::config::BrokerConfig;
pub use broker::error::{BrokerError, ErrorKind, Result};
pub use broker::router::{Destination, ExchangeKind};
pub use message::ack::{AckMode, PublishAck};
pub use message::record::{Message, ProducerRecord, TopicPartition};
pub use subscriber::types::{Assignment, Delivery, GroupMode, HeartbeatStatus, JoinOptions};

pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::broker::config::{BrokerConfig, RetentionPolicy};
    pub use crate::broker::consumer::group::GroupState;
    pub use crate::broker::error::BrokerError;
    pub use crate::broker::router::{Destination, ExchangeKind};
    pub use crate::message::ack::{AckMode, PublishAck};
    pub use crate::message::record::{ProducerRecord, TopicPartition};
    pub use crate::subscriber::types::{Assignment, Delivery, HeartbeatStatus, JoinOptions};
}
