use crate::message::record::TopicPartition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Returned to the producer once a publish has been appended.
///
/// An exchange publish may land in several partitions, one entry each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub destination: String,
    pub written: Vec<(TopicPartition, u64)>,
}

impl PublishAck {
    pub fn new(destination: &str, written: Vec<(TopicPartition, u64)>) -> Self {
        PublishAck {
            destination: destination.to_string(),
            written,
        }
    }

    /// Offset of the first (or only) write.
    pub fn offset(&self) -> Option<u64> {
        self.written.first().map(|(_, offset)| *offset)
    }
}

impl fmt::Display for PublishAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let written: Vec<String> = self
            .written
            .iter()
            .map(|(tp, offset)| format!("{}@{}", tp, offset))
            .collect();
        write!(
            f,
            "PublishAck {{ destination: {}, written: [{}] }}",
            self.destination,
            written.join(", ")
        )
    }
}

/// How a consumer acknowledgment is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acking offset N settles every offset up to and including N.
    #[default]
    Cumulative,
    /// Only the exact offset is settled.
    Individual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_ack_display() {
        let ack = PublishAck::new(
            "logs",
            vec![
                (TopicPartition::new("q1", 0), 4),
                (TopicPartition::new("q2", 0), 9),
            ],
        );
        assert_eq!(
            format!("{}", ack),
            "PublishAck { destination: logs, written: [q1-0@4, q2-0@9] }"
        );
        assert_eq!(ack.offset(), Some(4));
    }

    #[test]
    fn test_ack_mode_default_is_cumulative() {
        assert_eq!(AckMode::default(), AckMode::Cumulative);
    }
}
