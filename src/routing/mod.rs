//! Peril routing contract
//!
//! The game's message kinds form a closed set. Each kind fixes where it is
//! published, how consumers bind to it, which queue durability it uses and
//! which encoding it travels in:
//!
//! | kind            | exchange | routing key          | binding        | queue                 | class     | encoding |
//! |-----------------|----------|----------------------|----------------|-----------------------|-----------|----------|
//! | pause           | direct   | `pause`              | `pause`        | `pause.<user>`        | transient | json     |
//! | army move       | topic    | `army_moves.<user>`  | `army_moves.*` | `army_moves.<user>`   | transient | json     |
//! | war recognition | topic    | `war.<user>`         | `war.*`        | `war`                 | durable   | json     |
//! | game log        | topic    | `game_logs.<user>`   | `game_logs.*`  | `game_logs`           | durable   | binary   |
//!
//! Every queue dead-letters into the topology's fanout exchange.

pub mod messages;

use std::future::Future;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::broker::{Channel, Connection};
use crate::codec::Encoding;
use crate::pubsub::{AckType, Dispatch, Subscription, publish, subscribe_dispatch};
use crate::topology::{ExchangeKind, QueueBinding, QueueType, Topology};
use crate::utils::{CodecError, Result};

pub use messages::{
    ArmyMove, GameLog, Location, Player, PlayingState, RecognitionOfWar, Unit, UnitRank,
};

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Pause,
    ArmyMove,
    WarRecognition,
    GameLog,
}

impl MessageKind {
    pub fn prefix(self) -> &'static str {
        match self {
            MessageKind::Pause => PAUSE_KEY,
            MessageKind::ArmyMove => ARMY_MOVES_PREFIX,
            MessageKind::WarRecognition => WAR_RECOGNITIONS_PREFIX,
            MessageKind::GameLog => GAME_LOG_SLUG,
        }
    }

    pub fn encoding(self) -> Encoding {
        match self {
            MessageKind::GameLog => Encoding::Binary,
            _ => Encoding::Json,
        }
    }

    pub fn exchange(self, topology: &Topology) -> &str {
        match self {
            MessageKind::Pause => &topology.direct_exchange,
            _ => &topology.topic_exchange,
        }
    }

    pub fn exchange_kind(self) -> ExchangeKind {
        match self {
            MessageKind::Pause => ExchangeKind::Direct,
            _ => ExchangeKind::Topic,
        }
    }

    /// Key a message from `username` is published under.
    pub fn routing_key(self, username: &str) -> String {
        match self {
            MessageKind::Pause => PAUSE_KEY.to_string(),
            _ => format!("{}.{username}", self.prefix()),
        }
    }

    /// Pattern consumers bind with to hear every player.
    pub fn binding_key(self) -> String {
        match self {
            MessageKind::Pause => PAUSE_KEY.to_string(),
            _ => format!("{}.*", self.prefix()),
        }
    }

    /// Per-player feeds get their own queue; shared consumers use one queue per kind.
    pub fn queue_name(self, username: &str) -> String {
        match self.queue_type() {
            QueueType::Transient => format!("{}.{username}", self.prefix()),
            QueueType::Durable => self.prefix().to_string(),
        }
    }

    pub fn queue_type(self) -> QueueType {
        match self {
            MessageKind::Pause | MessageKind::ArmyMove => QueueType::Transient,
            MessageKind::WarRecognition | MessageKind::GameLog => QueueType::Durable,
        }
    }

    pub fn binding(self, topology: &Topology, username: &str) -> QueueBinding {
        QueueBinding::new(
            self.exchange(topology),
            self.exchange_kind(),
            self.queue_name(username),
            self.binding_key(),
            self.queue_type(),
        )
        .with_dead_letter(topology.dead_letter_exchange.as_str())
    }
}

/// A game message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum GameMessage {
    Pause(PlayingState),
    Move(ArmyMove),
    War(RecognitionOfWar),
    Log(GameLog),
}

impl GameMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            GameMessage::Pause(_) => MessageKind::Pause,
            GameMessage::Move(_) => MessageKind::ArmyMove,
            GameMessage::War(_) => MessageKind::WarRecognition,
            GameMessage::Log(_) => MessageKind::GameLog,
        }
    }
}

/// Publish `message` as `username` following the kind's routing contract.
pub async fn publish_message(
    channel: &dyn Channel,
    topology: &Topology,
    username: &str,
    message: &GameMessage,
) -> Result<()> {
    let kind = message.kind();
    let exchange = kind.exchange(topology);
    let key = kind.routing_key(username);
    let encoding = kind.encoding();
    match message {
        GameMessage::Pause(state) => publish(channel, exchange, &key, state, encoding).await,
        GameMessage::Move(mv) => publish(channel, exchange, &key, mv, encoding).await,
        GameMessage::War(war) => publish(channel, exchange, &key, war, encoding).await,
        GameMessage::Log(log) => publish(channel, exchange, &key, log, encoding).await,
    }
}

type HandlerFn<T> = Box<dyn FnMut(T) -> BoxFuture<'static, AckType> + Send>;

/// A handler for exactly one message kind.
pub enum Handler {
    Pause(HandlerFn<PlayingState>),
    Move(HandlerFn<ArmyMove>),
    War(HandlerFn<RecognitionOfWar>),
    Log(HandlerFn<GameLog>),
}

impl Handler {
    pub fn pause<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(PlayingState) -> Fut + Send + 'static,
        Fut: Future<Output = AckType> + Send + 'static,
    {
        Handler::Pause(Box::new(move |state| f(state).boxed()))
    }

    pub fn army_move<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(ArmyMove) -> Fut + Send + 'static,
        Fut: Future<Output = AckType> + Send + 'static,
    {
        Handler::Move(Box::new(move |mv| f(mv).boxed()))
    }

    pub fn war<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(RecognitionOfWar) -> Fut + Send + 'static,
        Fut: Future<Output = AckType> + Send + 'static,
    {
        Handler::War(Box::new(move |war| f(war).boxed()))
    }

    pub fn game_log<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(GameLog) -> Fut + Send + 'static,
        Fut: Future<Output = AckType> + Send + 'static,
    {
        Handler::Log(Box::new(move |log| f(log).boxed()))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Handler::Pause(_) => MessageKind::Pause,
            Handler::Move(_) => MessageKind::ArmyMove,
            Handler::War(_) => MessageKind::WarRecognition,
            Handler::Log(_) => MessageKind::GameLog,
        }
    }
}

#[async_trait]
impl Dispatch for Handler {
    async fn dispatch(&mut self, payload: &[u8]) -> Result<AckType, CodecError> {
        let encoding = self.kind().encoding();
        let decision = match self {
            Handler::Pause(handler) => handler(encoding.decode(payload)?).await,
            Handler::Move(handler) => handler(encoding.decode(payload)?).await,
            Handler::War(handler) => handler(encoding.decode(payload)?).await,
            Handler::Log(handler) => handler(encoding.decode(payload)?).await,
        };
        Ok(decision)
    }
}

/// Subscribe `handler` on behalf of `username`, using its kind's binding.
pub async fn subscribe_kind(
    conn: &dyn Connection,
    topology: &Topology,
    username: &str,
    prefetch: u16,
    handler: Handler,
) -> Result<Subscription> {
    let binding = handler.kind().binding(topology, username);
    subscribe_dispatch(conn, &binding, prefetch, handler).await
}
