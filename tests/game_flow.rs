//! End-to-end game traffic against the in-memory broker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peril::AckType;
use peril::broker::{Connection, MemoryBroker};
use peril::persistence::GameLogStore;
use peril::pubsub::{DEFAULT_PREFETCH, Dispatch, subscribe_dispatch};
use peril::routing::{
    ArmyMove, GameLog, GameMessage, Handler, Player, PlayingState, Unit, UnitRank,
    publish_message, subscribe_kind,
};
use peril::topology::{ExchangeKind, QueueBinding, QueueType, Topology, declare_exchanges};
use peril::utils::CodecError;
use tempfile::TempDir;

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn player(name: &str, location: &str) -> Player {
    let units = (1..=2)
        .map(|id| {
            (
                id,
                Unit {
                    id,
                    rank: UnitRank::Cavalry,
                    location: location.to_string(),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();
    Player {
        username: name.to_string(),
        units,
    }
}

/// Counts raw dead-lettered payloads.
struct DeadLetters(Arc<Mutex<Vec<Vec<u8>>>>);

#[async_trait]
impl Dispatch for DeadLetters {
    async fn dispatch(&mut self, payload: &[u8]) -> Result<AckType, CodecError> {
        self.0.lock().unwrap().push(payload.to_vec());
        Ok(AckType::Ack)
    }
}

#[tokio::test]
async fn every_player_sees_every_move() {
    let broker = MemoryBroker::new();
    let topology = Topology::default();
    let server = broker.connect();
    let setup = server.create_channel().await.unwrap();
    declare_exchanges(setup.as_ref(), &topology).await.unwrap();

    let mut seen = Vec::new();
    let mut subscriptions = Vec::new();
    let mut connections = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let conn = broker.connect();
        let moves = Arc::new(Mutex::new(Vec::new()));
        let sink = moves.clone();
        let subscription = subscribe_kind(
            &conn,
            &topology,
            name,
            DEFAULT_PREFETCH,
            Handler::army_move(move |mv: ArmyMove| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(mv.player.username);
                    AckType::Ack
                }
            }),
        )
        .await
        .unwrap();
        assert_eq!(subscription.queue(), format!("army_moves.{name}"));
        seen.push(moves);
        subscriptions.push(subscription);
        connections.push(conn);
    }

    let alice_channel = connections[0].create_channel().await.unwrap();
    let mv = GameMessage::Move(ArmyMove {
        player: player("alice", "europe"),
        units: player("alice", "europe").units.into_values().collect(),
        to_location: "africa".to_string(),
    });
    publish_message(alice_channel.as_ref(), &topology, "alice", &mv)
        .await
        .unwrap();

    for moves in &seen {
        eventually(|| moves.lock().unwrap().len() == 1).await;
        assert_eq!(*moves.lock().unwrap(), vec!["alice".to_string()]);
    }

    // a player leaving takes its transient queue along
    let carol = connections.pop().unwrap();
    carol.close().await.unwrap();
    eventually(|| !broker.has_queue("army_moves.carol")).await;
    assert!(broker.has_queue("army_moves.alice"));

    for subscription in subscriptions {
        subscription.close().await.unwrap();
    }
}

#[tokio::test]
async fn server_collects_logs_and_broadcasts_pause() {
    let tmp = TempDir::new().unwrap();
    let store = GameLogStore::open(tmp.path().join("logs").to_str().unwrap(), None).unwrap();

    let broker = MemoryBroker::new();
    let topology = Topology::default();
    let server = broker.connect();
    let server_channel = server.create_channel().await.unwrap();
    declare_exchanges(server_channel.as_ref(), &topology)
        .await
        .unwrap();

    let collector_store = store.clone();
    let collector = subscribe_kind(
        &server,
        &topology,
        "server",
        DEFAULT_PREFETCH,
        Handler::game_log(move |log: GameLog| {
            let store = collector_store.clone();
            async move {
                match store.append(&log) {
                    Ok(()) => AckType::Ack,
                    Err(_) => AckType::NackRequeue,
                }
            }
        }),
    )
    .await
    .unwrap();

    let client = broker.connect();
    let paused = Arc::new(Mutex::new(Vec::new()));
    let sink = paused.clone();
    let pause_sub = subscribe_kind(
        &client,
        &topology,
        "bob",
        DEFAULT_PREFETCH,
        Handler::pause(move |state: PlayingState| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(state.is_paused);
                AckType::Ack
            }
        }),
    )
    .await
    .unwrap();

    let bob_channel = client.create_channel().await.unwrap();
    for message in ["bob moved to asia", "bob declared war on alice"] {
        let log = GameMessage::Log(GameLog::now("bob", message));
        publish_message(bob_channel.as_ref(), &topology, "bob", &log)
            .await
            .unwrap();
    }

    for is_paused in [true, false] {
        let pause = GameMessage::Pause(PlayingState { is_paused });
        publish_message(server_channel.as_ref(), &topology, "server", &pause)
            .await
            .unwrap();
    }

    eventually(|| paused.lock().unwrap().len() == 2).await;
    assert_eq!(*paused.lock().unwrap(), vec![true, false]);

    eventually(|| broker.queue_depth("game_logs") == Some(0)).await;
    // records written within the same millisecond have no fixed order
    let mut stored: Vec<String> = store
        .logs_for("bob")
        .unwrap()
        .into_iter()
        .map(|log| log.message)
        .collect();
    stored.sort();
    assert_eq!(stored, vec!["bob declared war on alice", "bob moved to asia"]);

    pause_sub.close().await.unwrap();
    collector.close().await.unwrap();
}

#[tokio::test]
async fn dead_letters_can_be_drained_by_an_inspector() {
    let broker = MemoryBroker::new();
    let topology = Topology::default();
    let conn = broker.connect();
    let channel = conn.create_channel().await.unwrap();
    declare_exchanges(channel.as_ref(), &topology).await.unwrap();

    let rejecting = subscribe_kind(
        &conn,
        &topology,
        "bob",
        DEFAULT_PREFETCH,
        Handler::pause(|_| async { AckType::NackDiscard }),
    )
    .await
    .unwrap();

    let pause = GameMessage::Pause(PlayingState { is_paused: true });
    publish_message(channel.as_ref(), &topology, "server", &pause)
        .await
        .unwrap();
    eventually(|| broker.queue_depth("peril_dlq") == Some(1)).await;

    let drained = Arc::new(Mutex::new(Vec::new()));
    let binding = QueueBinding::new(
        topology.dead_letter_exchange.as_str(),
        ExchangeKind::Fanout,
        topology.dead_letter_queue.as_str(),
        "",
        QueueType::Durable,
    );
    let inspector = subscribe_dispatch(
        &conn,
        &binding,
        DEFAULT_PREFETCH,
        DeadLetters(drained.clone()),
    )
    .await
    .unwrap();

    eventually(|| drained.lock().unwrap().len() == 1).await;
    assert_eq!(drained.lock().unwrap()[0], br#"{"IsPaused":true}"#.to_vec());
    eventually(|| broker.queue_depth("peril_dlq") == Some(0)).await;

    inspector.close().await.unwrap();
    rejecting.close().await.unwrap();
}

#[tokio::test]
async fn durable_war_queue_survives_a_restart() {
    let broker = MemoryBroker::new();
    let topology = Topology::default();
    let conn = broker.connect();
    let channel = conn.create_channel().await.unwrap();
    declare_exchanges(channel.as_ref(), &topology).await.unwrap();

    let war_binding = peril::routing::MessageKind::WarRecognition.binding(&topology, "alice");
    let (bind_channel, _) = peril::topology::declare_and_bind(&conn, &war_binding)
        .await
        .unwrap();
    bind_channel.close().await.unwrap();

    let war = GameMessage::War(peril::routing::RecognitionOfWar {
        attacker: player("alice", "europe"),
        defender: player("bob", "europe"),
    });
    publish_message(channel.as_ref(), &topology, "alice", &war)
        .await
        .unwrap();

    broker.restart();
    assert_eq!(broker.queue_depth("war"), Some(1));
    assert!(conn.create_channel().await.is_err());

    let fresh = broker.connect();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = subscribe_kind(
        &fresh,
        &topology,
        "bob",
        DEFAULT_PREFETCH,
        Handler::war(move |war| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(war);
                AckType::Ack
            }
        }),
    )
    .await
    .unwrap();

    eventually(|| received.lock().unwrap().len() == 1).await;
    eventually(|| broker.queue_depth("war") == Some(0)).await;
    subscription.close().await.unwrap();
}
