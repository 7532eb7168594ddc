//! In-process broker
//!
//! `MemoryBroker` keeps exchanges, queues and consumers behind a single
//! lock and reproduces the parts of AMQP 0-9-1 broker behavior the pub/sub
//! layer relies on:
//! - direct / topic / fanout routing through bindings
//! - idempotent declarations that fail on conflicting attributes
//! - exclusive queues locked to their connection, auto-delete when the last
//!   consumer goes away
//! - per-consumer prefetch, redelivery at the head of the queue on requeue,
//!   dead-letter routing on discard
//! - unacked deliveries returned to the queue when their channel closes
//!
//! Concurrency note: no lock is ever held across an `.await`. Deliveries are
//! pushed into an unbounded per-consumer channel while the lock is held and
//! turned into `Delivery` values on the consumer side.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Acknowledger, Channel, Connection, Delivery, DeliveryStream};
use crate::pubsub::AckType;
use crate::topology::{ExchangeKind, QueueInfo, QueueType};
use crate::utils::{PubSubError, Result, TopologyError};

type ConnectionId = u64;
type ChannelId = u64;

#[derive(Debug, Clone)]
struct Envelope {
    routing_key: String,
    content_type: String,
    payload: Vec<u8>,
    redelivered: bool,
}

/// What a consumer's stream receives; becomes a `Delivery` outside the lock.
struct Dispatched {
    tag: u64,
    envelope: Envelope,
}

struct Consumer {
    tag: String,
    channel: ChannelId,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Dispatched>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer: String,
    envelope: Envelope,
}

struct Queue {
    queue_type: QueueType,
    dead_letter_exchange: Option<String>,
    owner: Option<ConnectionId>,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    fn new(
        queue_type: QueueType,
        dead_letter_exchange: Option<String>,
        owner: Option<ConnectionId>,
    ) -> Self {
        Self {
            queue_type,
            dead_letter_exchange,
            owner,
            bindings: Vec::new(),
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn check_owner(&self, name: &str, conn: ConnectionId) -> Result<(), TopologyError> {
        match self.owner {
            Some(owner) if owner != conn => Err(TopologyError::QueueLocked(name.to_string())),
            _ => Ok(()),
        }
    }

    /// Round-robin over consumers that still have prefetch headroom.
    fn next_ready_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.next_consumer + offset) % n;
            if self.consumers[idx].has_capacity() {
                self.next_consumer = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Put every unacked delivery held by `consumers` back at the head, in tag order.
    fn requeue_held_by(&mut self, consumers: &[String]) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, held)| consumers.contains(&held.consumer))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(held) = self.unacked.remove(&tag) {
                let mut envelope = held.envelope;
                envelope.redelivered = true;
                self.ready.push_front(envelope);
            }
        }
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }
}

struct ChannelState {
    connection: ConnectionId,
    prefetch: u16,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    channels: HashMap<ChannelId, ChannelState>,
    connections: HashSet<ConnectionId>,
    next_id: u64,
    next_tag: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel: ChannelId) -> Result<ConnectionId> {
        self.channels
            .get(&channel)
            .map(|state| state.connection)
            .ok_or(PubSubError::ChannelClosed)
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), TopologyError> {
        match self.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TopologyError::ExchangeMismatch {
                name: name.to_string(),
                existing: *existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), kind);
                debug!(exchange = %name, %kind, "exchange declared");
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        conn: ConnectionId,
        name: &str,
        queue_type: QueueType,
        dead_letter_exchange: Option<&str>,
    ) -> Result<QueueInfo, TopologyError> {
        if let Some(queue) = self.queues.get(name) {
            queue.check_owner(name, conn)?;
            if queue.queue_type != queue_type {
                return Err(TopologyError::QueueMismatch {
                    name: name.to_string(),
                    existing: queue.queue_type,
                    requested: queue_type,
                });
            }
            if queue.dead_letter_exchange.as_deref() != dead_letter_exchange {
                return Err(TopologyError::DeadLetterMismatch {
                    name: name.to_string(),
                    existing: queue.dead_letter_exchange.clone(),
                });
            }
            return Ok(queue.info(name));
        }

        let owner = queue_type.exclusive().then_some(conn);
        let queue = Queue::new(
            queue_type,
            dead_letter_exchange.map(str::to_string),
            owner,
        );
        let info = queue.info(name);
        self.queues.insert(name.to_string(), queue);
        debug!(queue = %name, ?queue_type, "queue declared");
        Ok(info)
    }

    fn bind_queue(
        &mut self,
        conn: ConnectionId,
        queue_name: &str,
        exchange: &str,
        key: &str,
    ) -> Result<(), TopologyError> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TopologyError::ExchangeNotFound(exchange.to_string()))?;
        kind.validate_binding_key(key)?;

        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| TopologyError::QueueNotFound(queue_name.to_string()))?;
        queue.check_owner(queue_name, conn)?;

        let binding = (exchange.to_string(), key.to_string());
        if !queue.bindings.contains(&binding) {
            queue.bindings.push(binding);
        }
        Ok(())
    }

    /// Copy `envelope` into every queue bound to `exchange` that matches `routing_key`.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<usize, TopologyError> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TopologyError::ExchangeNotFound(exchange.to_string()))?;

        let targets: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue
                    .bindings
                    .iter()
                    .any(|(bound, pattern)| bound == exchange && kind.routes(pattern, routing_key))
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(envelope.clone());
            }
        }
        for name in &targets {
            self.pump(name);
        }

        if targets.is_empty() {
            debug!(%exchange, %routing_key, "message unroutable, dropped");
        }
        Ok(targets.len())
    }

    /// Hand ready messages to consumers until the queue drains or every
    /// consumer is at its prefetch limit.
    fn pump(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let mut lost_consumer = false;

        while !queue.ready.is_empty() {
            let Some(idx) = queue.next_ready_consumer() else {
                break;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;

            let consumer = &mut queue.consumers[idx];
            let dispatched = Dispatched {
                tag,
                envelope: envelope.clone(),
            };
            if consumer.sender.send(dispatched).is_err() {
                // stream dropped without closing its channel
                let gone = queue.consumers.remove(idx);
                queue.ready.push_front(envelope);
                queue.requeue_held_by(&[gone.tag]);
                lost_consumer = true;
                continue;
            }

            consumer.in_flight += 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    consumer: consumer.tag.clone(),
                    envelope,
                },
            );
        }

        if lost_consumer && queue.consumers.is_empty() && queue.queue_type.auto_delete() {
            self.queues.remove(queue_name);
            debug!(queue = %queue_name, "auto-deleted queue after last consumer vanished");
        }
    }

    fn settle(&mut self, queue_name: &str, tag: u64, decision: AckType) -> Result<()> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or(PubSubError::UnknownDeliveryTag(tag))?;
        let Unacked {
            consumer,
            mut envelope,
        } = queue
            .unacked
            .remove(&tag)
            .ok_or(PubSubError::UnknownDeliveryTag(tag))?;

        if let Some(holder) = queue.consumers.iter_mut().find(|c| c.tag == consumer) {
            holder.in_flight = holder.in_flight.saturating_sub(1);
        }

        let mut dead_letter = None;
        match decision {
            AckType::Ack => {}
            AckType::NackRequeue => {
                envelope.redelivered = true;
                queue.ready.push_front(envelope);
            }
            AckType::NackDiscard => {
                dead_letter = queue
                    .dead_letter_exchange
                    .clone()
                    .map(|exchange| (exchange, envelope));
            }
        }

        self.pump(queue_name);

        if let Some((exchange, mut envelope)) = dead_letter {
            envelope.redelivered = false;
            let routing_key = envelope.routing_key.clone();
            match self.route(&exchange, &routing_key, envelope) {
                Ok(copies) => debug!(queue = %queue_name, %exchange, copies, "message dead-lettered"),
                Err(err) => warn!(queue = %queue_name, "dead-letter routing failed, message dropped: {err}"),
            }
        }
        Ok(())
    }

    fn close_channel(&mut self, channel: ChannelId) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        let mut abandoned = Vec::new();

        for name in &names {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };
            let gone: Vec<String> = queue
                .consumers
                .iter()
                .filter(|c| c.channel == channel)
                .map(|c| c.tag.clone())
                .collect();
            if gone.is_empty() {
                continue;
            }

            queue.consumers.retain(|c| c.channel != channel);
            queue.requeue_held_by(&gone);

            if queue.consumers.is_empty() && queue.queue_type.auto_delete() {
                abandoned.push(name.clone());
            }
        }

        for name in abandoned {
            self.queues.remove(&name);
            debug!(queue = %name, "auto-deleted queue after last consumer left");
        }
        for name in &names {
            self.pump(name);
        }
    }

    fn close_connection(&mut self, conn: ConnectionId) {
        let channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == conn)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        self.connections.remove(&conn);
        self.queues.retain(|_, queue| queue.owner != Some(conn));
    }
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new client connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = self.lock();
        let id = state.next_id();
        state.connections.insert(id);
        MemoryConnection {
            broker: self.clone(),
            id,
        }
    }

    /// Ready plus unacknowledged messages, `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
    }

    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    /// Payloads waiting in `queue`, head first.
    pub fn ready_payloads(&self, queue: &str) -> Option<Vec<Vec<u8>>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|e| e.payload.clone()).collect())
    }

    /// Simulate a broker restart: every connection drops, transient queues
    /// vanish, durable queues keep their messages (unacked ones included).
    pub fn restart(&self) {
        let mut state = self.lock();
        let connections: Vec<ConnectionId> = state.connections.iter().copied().collect();
        for conn in connections {
            state.close_connection(conn);
        }
        state.queues.retain(|_, queue| queue.queue_type.durable());
        debug!("memory broker restarted");
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: ConnectionId,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(PubSubError::Connection("connection closed".to_string()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        Ok(state.declare_exchange(name, kind)?)
    }

    async fn declare_queue(
        &self,
        name: &str,
        queue_type: QueueType,
        dead_letter_exchange: Option<&str>,
    ) -> Result<QueueInfo> {
        let mut state = self.broker.lock();
        let conn = state.ensure_open(self.id)?;
        Ok(state.declare_queue(conn, name, queue_type, dead_letter_exchange)?)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        let conn = state.ensure_open(self.id)?;
        Ok(state.bind_queue(conn, queue, exchange, key)?)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(PubSubError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            let conn = state.ensure_open(self.id)?;
            let prefetch = state
                .channels
                .get(&self.id)
                .map(|c| c.prefetch)
                .unwrap_or_default();
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TopologyError::QueueNotFound(queue.to_string()))?;
            target.check_owner(queue, conn)?;
            target.consumers.push(Consumer {
                tag: format!("ctag-{}", Uuid::new_v4()),
                channel: self.id,
                prefetch,
                in_flight: 0,
                sender,
            });
            state.pump(queue);
        }

        let broker = self.broker.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|dispatched| (dispatched, rx))
        })
        .map(move |Dispatched { tag, envelope }| {
            let acker = MemoryAcker {
                broker: broker.clone(),
                queue: queue.clone(),
                tag,
            };
            Ok(Delivery::new(
                envelope.payload,
                Some(envelope.content_type),
                envelope.routing_key,
                envelope.redelivered,
                Box::new(acker),
            ))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let envelope = Envelope {
            routing_key: routing_key.to_string(),
            content_type: content_type.to_string(),
            payload,
            redelivered: false,
        };
        state.route(exchange, routing_key, envelope)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.lock().settle(&self.queue, self.tag, AckType::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let decision = if requeue {
            AckType::NackRequeue
        } else {
            AckType::NackDiscard
        };
        self.broker.lock().settle(&self.queue, self.tag, decision)
    }
}
