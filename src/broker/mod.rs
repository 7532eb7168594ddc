//! Broker connections and channels
//!
//! The rest of the crate talks to a broker only through the `Connection`
//! and `Channel` traits defined here, so the same publisher, subscriber and
//! topology code runs against:
//! - `AmqpConnection`: a real AMQP 0-9-1 broker (RabbitMQ) via `lapin`
//! - `MemoryBroker`: an in-process broker with the same routing and
//!   acknowledgment semantics, used by tests and local runs
//!
//! Handles are passed explicitly; there is no global connection.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::pubsub::AckType;
use crate::topology::{ExchangeKind, QueueInfo, QueueType};
use crate::utils::Result;

pub use amqp::AmqpConnection;
pub use memory::{MemoryBroker, MemoryConnection};

/// Stream of inbound deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Close the connection and every channel opened on it.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(
        &self,
        name: &str,
        queue_type: QueueType,
        dead_letter_exchange: Option<&str>,
    ) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<()>;

    /// Cap the number of unacknowledged deliveries held by consumers started
    /// on this channel afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Broker-side handle used to settle a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One inbound message. Settling consumes it, so its handle resolves once.
pub struct Delivery {
    payload: Vec<u8>,
    content_type: Option<String>,
    routing_key: String,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        content_type: Option<String>,
        routing_key: String,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            content_type,
            routing_key,
            redelivered,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Issue the broker call matching `decision`.
    pub async fn settle(self, decision: AckType) -> Result<()> {
        match decision {
            AckType::Ack => self.acker.ack().await,
            AckType::NackRequeue => self.acker.nack(true).await,
            AckType::NackDiscard => self.acker.nack(false).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("content_type", &self.content_type)
            .field("redelivered", &self.redelivered)
            .field("len", &self.payload.len())
            .finish()
    }
}
