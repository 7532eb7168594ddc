use super::{
    ExchangeKind, MAX_KEY_LEN, QueueBinding, QueueInfo, QueueType, Topology, declare_and_bind,
    declare_exchanges, topic_matches,
};
use crate::broker::{Channel, Connection, DeliveryStream, MemoryBroker};
use crate::utils::{PubSubError, Result, TopologyError};

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn war_binding(queue_type: QueueType) -> QueueBinding {
    QueueBinding::new("peril_topic", ExchangeKind::Topic, "war", "war.*", queue_type)
}

/// Accepts every call and counts channels opened and bind attempts.
#[derive(Default)]
struct Permissive {
    channels: AtomicUsize,
    binds: Arc<AtomicUsize>,
}

struct PermissiveChannel {
    binds: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for Permissive {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        self.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(PermissiveChannel {
            binds: self.binds.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Channel for PermissiveChannel {
    async fn declare_exchange(&self, _: &str, _: ExchangeKind) -> Result<()> {
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _: QueueType, _: Option<&str>) -> Result<QueueInfo> {
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(&self, _: &str, _: &str, _: &str) -> Result<()> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_prefetch(&self, _: u16) -> Result<()> {
        Ok(())
    }

    async fn consume(&self, _: &str) -> Result<DeliveryStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn publish(&self, _: &str, _: &str, _: &str, _: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn topic_wildcards() {
    assert!(topic_matches("move.*", "move.alice"));
    assert!(!topic_matches("move.*", "move"));
    assert!(!topic_matches("move.*", "move.alice.extra"));
    assert!(!topic_matches("pause.*", "move.alice"));

    assert!(topic_matches("#", "anything.at.all"));
    assert!(topic_matches("game_logs.#", "game_logs"));
    assert!(topic_matches("game_logs.#", "game_logs.alice.europe"));
    assert!(topic_matches("*.alice", "war.alice"));
    assert!(topic_matches("a.#.z", "a.b.c.z"));
    assert!(topic_matches("a.#.z", "a.z"));
    assert!(!topic_matches("a.#.z", "a.b.c"));
    assert!(topic_matches("war", "war"));
}

#[test]
fn stacked_hashes_match_in_bounded_time() {
    let key = vec!["a"; 30].join(".");
    let pattern = format!("{}.x", vec!["#"; 12].join("."));
    assert!(ExchangeKind::Topic.validate_binding_key(&pattern).is_ok());

    let started = Instant::now();
    assert!(!topic_matches(&pattern, &key));
    assert!(topic_matches(&pattern, &format!("{key}.x")));
    assert!(topic_matches("#.#.a.#.*.#", &key));
    assert!(!topic_matches("#.#.b.#", &key));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn exchange_kinds_route_differently() {
    assert!(ExchangeKind::Direct.routes("pause", "pause"));
    assert!(!ExchangeKind::Direct.routes("pause", "pause.bob"));
    assert!(ExchangeKind::Topic.routes("army_moves.*", "army_moves.bob"));
    assert!(ExchangeKind::Fanout.routes("", "anything"));
}

#[test]
fn binding_key_validation() {
    assert!(ExchangeKind::Topic.validate_binding_key("army_moves.*").is_ok());
    assert!(ExchangeKind::Topic.validate_binding_key("#").is_ok());
    assert!(ExchangeKind::Topic.validate_binding_key("a.#.b").is_ok());
    assert!(ExchangeKind::Topic.validate_binding_key("move*").is_err());
    assert!(ExchangeKind::Topic.validate_binding_key("a..b").is_err());
    assert!(ExchangeKind::Topic.validate_binding_key("").is_err());

    assert!(ExchangeKind::Direct.validate_binding_key("pause").is_ok());
    assert!(ExchangeKind::Direct.validate_binding_key("").is_ok());
    assert!(ExchangeKind::Direct.validate_binding_key("pause.#").is_err());

    assert!(ExchangeKind::Fanout.validate_binding_key("a..*#").is_ok());

    let long = "k".repeat(MAX_KEY_LEN + 1);
    for kind in [ExchangeKind::Direct, ExchangeKind::Topic, ExchangeKind::Fanout] {
        assert!(kind.validate_binding_key(&long).is_err());
    }
}

#[test]
fn durability_class_flags() {
    assert!(QueueType::Durable.durable());
    assert!(!QueueType::Durable.auto_delete());
    assert!(!QueueType::Durable.exclusive());

    assert!(!QueueType::Transient.durable());
    assert!(QueueType::Transient.auto_delete());
    assert!(QueueType::Transient.exclusive());
}

#[test]
fn queue_binding_builder() {
    let binding = war_binding(QueueType::Durable);
    assert_eq!(binding.dead_letter_exchange, None);

    let binding = binding.with_dead_letter("peril_dlx");
    assert_eq!(binding.dead_letter_exchange.as_deref(), Some("peril_dlx"));
    assert_eq!(binding.queue, "war");
}

#[tokio::test]
async fn declare_and_bind_is_idempotent() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let setup = conn.create_channel().await.unwrap();
    declare_exchanges(setup.as_ref(), &Topology::default())
        .await
        .unwrap();

    let binding = war_binding(QueueType::Durable).with_dead_letter("peril_dlx");

    let (_first, info) = declare_and_bind(&conn, &binding).await.unwrap();
    assert_eq!(info.name, "war");
    let (_second, info) = declare_and_bind(&broker.connect(), &binding).await.unwrap();
    assert_eq!(info.name, "war");
    assert_eq!(info.message_count, 0);
}

#[tokio::test]
async fn conflicting_durability_fails_and_leaves_no_channel() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let setup = conn.create_channel().await.unwrap();
    declare_exchanges(setup.as_ref(), &Topology::default())
        .await
        .unwrap();

    let durable = war_binding(QueueType::Durable);
    let (_channel, _) = declare_and_bind(&conn, &durable).await.unwrap();
    let channels_before = broker.channel_count();

    let transient = war_binding(QueueType::Transient);
    let err = declare_and_bind(&conn, &transient)
        .await
        .err()
        .expect("durability conflict must fail");
    assert!(matches!(
        err,
        PubSubError::Topology(TopologyError::QueueMismatch { .. })
    ));
    assert_eq!(broker.channel_count(), channels_before);
}

#[tokio::test]
async fn binding_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();

    let binding = war_binding(QueueType::Durable);
    let err = declare_and_bind(&conn, &binding)
        .await
        .err()
        .expect("missing exchange must fail");
    assert!(matches!(
        err,
        PubSubError::Topology(TopologyError::ExchangeNotFound(_))
    ));
    assert_eq!(broker.channel_count(), 0);
}

#[tokio::test]
async fn malformed_key_is_rejected_before_the_broker_sees_it() {
    let conn = Permissive::default();

    let direct = QueueBinding::new(
        "peril_direct",
        ExchangeKind::Direct,
        "pause.bob",
        "pause.*",
        QueueType::Transient,
    );
    let topic = QueueBinding::new(
        "peril_topic",
        ExchangeKind::Topic,
        "moves",
        "army_moves..bob",
        QueueType::Durable,
    );
    for binding in [direct, topic] {
        let err = declare_and_bind(&conn, &binding)
            .await
            .err()
            .expect("malformed key must fail");
        assert!(matches!(
            err,
            PubSubError::Topology(TopologyError::MalformedBindingKey { .. })
        ));
    }
    assert_eq!(conn.channels.load(Ordering::SeqCst), 0);
    assert_eq!(conn.binds.load(Ordering::SeqCst), 0);

    let (_channel, info) = declare_and_bind(&conn, &war_binding(QueueType::Durable))
        .await
        .unwrap();
    assert_eq!(info.name, "war");
    assert_eq!(conn.binds.load(Ordering::SeqCst), 1);
}

#[test]
fn default_topology_names() {
    let topology = Topology::default();
    assert_eq!(topology.direct_exchange, "peril_direct");
    assert_eq!(topology.topic_exchange, "peril_topic");
    assert_eq!(topology.dead_letter_exchange, "peril_dlx");
    assert_eq!(topology.dead_letter_queue, "peril_dlq");
}
