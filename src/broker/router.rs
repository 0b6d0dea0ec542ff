//! Exchange routing and topic partitioning.
//!
//! Exchanges map a routing key onto bound destinations:
//! - `Direct` - the binding pattern must equal the routing key
//! - `Topic` - dot-separated patterns where `*` matches one word and `#`
//!   matches zero or more words
//! - `Fanout` - every binding matches
//!
//! A destination names a topic and optionally a fixed partition. Destinations
//! without a partition, and publishes addressed straight at a topic, go
//! through [`select_partition`].

use crate::broker::error::{BrokerError, Result};
use crate::broker::topic::Topic;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

/// Where a routed message lands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub topic: String,
    pub partition: Option<u32>,
}

impl Destination {
    /// A queue-like destination: the topic's partitioner picks the partition.
    pub fn topic(topic: &str) -> Self {
        Destination {
            topic: topic.to_string(),
            partition: None,
        }
    }

    pub fn partition(topic: &str, partition: u32) -> Self {
        Destination {
            topic: topic.to_string(),
            partition: Some(partition),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub pattern: String,
    pub destination: Destination,
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub bindings: Vec<Binding>,
    /// Receives messages no binding matched.
    pub dead_letter: Option<Destination>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind, dead_letter: Option<Destination>) -> Self {
        Exchange {
            name: name.to_string(),
            kind,
            bindings: Vec::new(),
            dead_letter,
        }
    }

    fn binding_matches(&self, pattern: &str, routing_key: &str) -> bool {
        match self.kind {
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Topic => topic_pattern_matches(pattern, routing_key),
            ExchangeKind::Fanout => true,
        }
    }

    /// Destinations for a routing key. Each destination appears once even
    /// when several bindings match it.
    pub fn route(&self, routing_key: Option<&str>) -> Result<Vec<Destination>> {
        let key = routing_key.unwrap_or("");
        let mut matched: Vec<Destination> = Vec::new();
        for binding in &self.bindings {
            if self.binding_matches(&binding.pattern, key) && !matched.contains(&binding.destination) {
                matched.push(binding.destination.clone());
            }
        }

        if matched.is_empty() {
            if let Some(dead_letter) = &self.dead_letter {
                log::debug!(
                    "No binding on {} matched {:?}, routing to dead letter {}",
                    self.name,
                    routing_key,
                    dead_letter.topic
                );
                return Ok(vec![dead_letter.clone()]);
            }
            return Err(BrokerError::NoMatchingBinding {
                exchange: self.name.clone(),
                routing_key: routing_key.map(str::to_string),
            });
        }
        Ok(matched)
    }
}

/// Dot-separated wildcard matching.
///
/// # Examples
///
/// ```
/// use rust_broker_core::broker::router::topic_pattern_matches;
///
/// assert!(topic_pattern_matches("user.#", "user.europe.payments"));
/// assert!(topic_pattern_matches("*.europe.*", "business.europe.order"));
/// assert!(!topic_pattern_matches("#.payments", "business.europe.order"));
/// ```
pub fn topic_pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

/// `matches[i][j]` holds whether `pattern[i..]` matches `key[j..]`, filled
/// from the back so every cell is computed once.
fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    let (p, k) = (pattern.len(), key.len());
    let mut matches = vec![vec![false; k + 1]; p + 1];
    matches[p][k] = true;

    for i in (0..p).rev() {
        for j in (0..=k).rev() {
            matches[i][j] = match pattern[i] {
                // Either `#` stops here, or it swallows one more segment.
                "#" => matches[i + 1][j] || (j < k && matches[i][j + 1]),
                "*" => j < k && matches[i + 1][j + 1],
                word => j < k && key[j] == word && matches[i + 1][j + 1],
            };
        }
    }
    matches[0][0]
}

/// Stable hash partitioning for keyed messages.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> u32 {
    if partition_count == 0 {
        return 0;
    }
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % partition_count as u64) as u32
}

/// Explicit override, else hash of the key, else round-robin.
pub fn select_partition(topic: &Topic, key: Option<&[u8]>, explicit: Option<u32>) -> Result<u32> {
    if let Some(partition) = explicit {
        topic.partition(partition)?;
        return Ok(partition);
    }
    Ok(match key {
        Some(key) => partition_for_key(key, topic.partition_count()),
        None => topic.next_round_robin(),
    })
}

/// Registry of exchanges.
#[derive(Debug, Default)]
pub struct Router {
    exchanges: RwLock<HashMap<String, Exchange>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, name: &str, kind: ExchangeKind, dead_letter: Option<Destination>) -> Result<()> {
        if name.is_empty() {
            return Err(BrokerError::InvalidArgument("exchange name must not be empty".to_string()));
        }
        let mut exchanges = self.exchanges.write();
        if exchanges.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("Exchange {}", name)));
        }
        exchanges.insert(name.to_string(), Exchange::new(name, kind, dead_letter));
        log::info!("Declared {:?} exchange {}", kind, name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exchanges.read().contains_key(name)
    }

    /// Adds a binding. Binding the same pattern to the same destination twice
    /// is a no-op.
    pub fn bind(&self, exchange: &str, pattern: &str, destination: Destination) -> Result<()> {
        let mut exchanges = self.exchanges.write();
        let exchange = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = Binding {
            pattern: pattern.to_string(),
            destination,
        };
        if !exchange.bindings.contains(&binding) {
            log::info!(
                "Bound {} on {} to {}",
                binding.pattern,
                exchange.name,
                binding.destination.topic
            );
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, pattern: &str, destination: &Destination) -> Result<bool> {
        let mut exchanges = self.exchanges.write();
        let exchange = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let before = exchange.bindings.len();
        exchange
            .bindings
            .retain(|b| !(b.pattern == pattern && &b.destination == destination));
        Ok(exchange.bindings.len() != before)
    }

    pub fn route(&self, exchange: &str, routing_key: Option<&str>) -> Result<Vec<Destination>> {
        self.exchanges
            .read()
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?
            .route(routing_key)
    }
}
