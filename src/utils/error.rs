//! Error types for the pub/sub layer.
//!
//! Setup-time failures (`Connection`, `Topology`) are surfaced to the caller
//! of `declare_and_bind` / `subscribe` / `publish`. Per-message failures
//! (`Decode`) never leave the dispatch loop.

use crate::topology::{ExchangeKind, QueueType};

/// Serialization failures for either encoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary: {0}")]
    Binary(#[from] bincode::Error),
}

/// Exchange/queue declaration or binding failures.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("exchange '{0}' does not exist")]
    ExchangeNotFound(String),

    #[error("exchange '{name}' already declared as {existing}, not {requested}")]
    ExchangeMismatch {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("queue '{name}' already declared as {existing:?}, not {requested:?}")]
    QueueMismatch {
        name: String,
        existing: QueueType,
        requested: QueueType,
    },

    #[error("queue '{name}' already declared with dead-letter exchange {existing:?}")]
    DeadLetterMismatch {
        name: String,
        existing: Option<String>,
    },

    /// The queue is exclusive to another connection.
    #[error("queue '{0}' is locked by another connection")]
    QueueLocked(String),

    #[error("binding key '{key}' is malformed for a {kind} exchange: {reason}")]
    MalformedBindingKey {
        key: String,
        kind: ExchangeKind,
        reason: &'static str,
    },

    /// The remote broker refused a declare or bind.
    #[error("broker rejected topology change: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("encode error: {0}")]
    Encode(CodecError),

    #[error("decode error: {0}")]
    Decode(CodecError),

    #[error("channel closed")]
    ChannelClosed,

    /// A delivery was settled twice, or after its channel went away.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PubSubError> = std::result::Result<T, E>;
