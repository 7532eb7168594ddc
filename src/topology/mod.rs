//! Queue topology
//!
//! Exchanges, queues and the bindings between them. This module owns:
//! - the durability classes a queue can be declared with
//! - the routing rules of each exchange kind (exact, wildcard, broadcast)
//! - `declare_and_bind`, which every publisher and subscriber calls
//!   independently before traffic flows, so it must stay idempotent
//! - `declare_exchanges`, the one-time bootstrap of the shared exchanges and
//!   the dead-letter sink
//!
//! Nothing here tears topology down. Transient queues disappear on their own
//! (auto-delete / exclusive); everything else is the operator's business.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::broker::{Channel, Connection};
use crate::utils::{Result, TopologyError};

/// AMQP short strings cap routing and binding keys at 255 bytes.
pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-separated words with `*` (one word) and `#` (zero or more words).
    Topic,
    /// Every bound queue gets a copy; keys are ignored.
    Fanout,
}

impl ExchangeKind {
    /// Check a binding key against the rules of this exchange kind.
    pub fn validate_binding_key(self, key: &str) -> Result<(), TopologyError> {
        let malformed = |reason| TopologyError::MalformedBindingKey {
            key: key.to_string(),
            kind: self,
            reason,
        };

        if key.len() > MAX_KEY_LEN {
            return Err(malformed("longer than 255 bytes"));
        }

        match self {
            ExchangeKind::Fanout => Ok(()),
            ExchangeKind::Direct => {
                if key.contains(['*', '#']) {
                    Err(malformed("wildcards are not allowed"))
                } else {
                    Ok(())
                }
            }
            ExchangeKind::Topic => {
                for word in key.split('.') {
                    if word.is_empty() {
                        return Err(malformed("empty word"));
                    }
                    if word != "*" && word != "#" && word.contains(['*', '#']) {
                        return Err(malformed("wildcard mixed into a word"));
                    }
                }
                Ok(())
            }
        }
    }

    /// Does a message published with `routing_key` land on a queue bound with `binding_key`?
    pub fn routes(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => topic_matches(binding_key, routing_key),
            ExchangeKind::Fanout => true,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        };
        f.write_str(name)
    }
}

/// Match a topic routing key against a binding pattern.
///
/// Runs in O(pattern words × key words) however many `#` the pattern holds.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let mut words: Vec<&str> = Vec::new();
    for word in pattern.split('.') {
        // a run of `#` matches exactly what a single `#` does
        if word == "#" && words.last() == Some(&"#") {
            continue;
        }
        words.push(word);
    }
    let key: Vec<&str> = routing_key.split('.').collect();

    // matched[j]: the pattern words consumed so far match key[..j]
    let mut matched = vec![false; key.len() + 1];
    matched[0] = true;
    for word in words {
        let mut next = vec![false; key.len() + 1];
        for j in 0..=key.len() {
            next[j] = match word {
                "#" => matched[j] || (j > 0 && next[j - 1]),
                "*" => j > 0 && matched[j - 1],
                literal => j > 0 && matched[j - 1] && key[j - 1] == literal,
            };
        }
        matched = next;
    }
    matched[key.len()]
}

/// Durability class of a queue, fixed at declaration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Survives broker restart, shared, never auto-deleted.
    Durable,
    /// Exclusive to the declaring connection, deleted with its last consumer.
    Transient,
}

impl QueueType {
    pub fn durable(self) -> bool {
        matches!(self, QueueType::Durable)
    }

    pub fn auto_delete(self) -> bool {
        matches!(self, QueueType::Transient)
    }

    pub fn exclusive(self) -> bool {
        matches!(self, QueueType::Transient)
    }
}

/// Everything `declare_and_bind` needs to know about one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub key: String,
    pub queue_type: QueueType,
    pub dead_letter_exchange: Option<String>,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        queue: impl Into<String>,
        key: impl Into<String>,
        queue_type: QueueType,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            queue: queue.into(),
            key: key.into(),
            queue_type,
            dead_letter_exchange: None,
        }
    }

    /// Route discarded messages to `exchange` instead of dropping them.
    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// What the broker reports back after a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Names of the shared exchanges and the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Topology {
    pub direct_exchange: String,
    pub topic_exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            direct_exchange: "peril_direct".to_string(),
            topic_exchange: "peril_topic".to_string(),
            dead_letter_exchange: "peril_dlx".to_string(),
            dead_letter_queue: "peril_dlq".to_string(),
        }
    }
}

/// Open a fresh channel, declare the queue and bind it to `binding.exchange`.
///
/// The binding key is checked against `binding.exchange_kind` before any
/// channel is opened; brokers accept keys that can never match. The channel
/// is closed again when any later step fails, so a failed call leaves no
/// channel behind and never a bound queue.
pub async fn declare_and_bind(
    conn: &dyn Connection,
    binding: &QueueBinding,
) -> Result<(Arc<dyn Channel>, QueueInfo)> {
    binding.exchange_kind.validate_binding_key(&binding.key)?;
    let channel = conn.create_channel().await?;

    match bind_on(channel.as_ref(), binding).await {
        Ok(info) => {
            debug!(
                queue = %info.name,
                exchange = %binding.exchange,
                key = %binding.key,
                "queue declared and bound"
            );
            Ok((channel, info))
        }
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!("Failed to close channel after topology error: {close_err}");
            }
            Err(err)
        }
    }
}

async fn bind_on(channel: &dyn Channel, binding: &QueueBinding) -> Result<QueueInfo> {
    let info = channel
        .declare_queue(
            &binding.queue,
            binding.queue_type,
            binding.dead_letter_exchange.as_deref(),
        )
        .await?;
    channel
        .bind_queue(&binding.queue, &binding.exchange, &binding.key)
        .await?;
    Ok(info)
}

/// Declare the direct, topic and dead-letter exchanges plus the durable
/// dead-letter queue. Safe to call on every start.
pub async fn declare_exchanges(channel: &dyn Channel, topology: &Topology) -> Result<()> {
    channel
        .declare_exchange(&topology.direct_exchange, ExchangeKind::Direct)
        .await?;
    channel
        .declare_exchange(&topology.topic_exchange, ExchangeKind::Topic)
        .await?;
    channel
        .declare_exchange(&topology.dead_letter_exchange, ExchangeKind::Fanout)
        .await?;

    channel
        .declare_queue(&topology.dead_letter_queue, QueueType::Durable, None)
        .await?;
    channel
        .bind_queue(&topology.dead_letter_queue, &topology.dead_letter_exchange, "")
        .await?;

    debug!(
        direct = %topology.direct_exchange,
        topic = %topology.topic_exchange,
        dead_letter = %topology.dead_letter_exchange,
        "exchanges declared"
    );
    Ok(())
}

#[cfg(test)]
mod tests;
