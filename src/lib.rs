//! # Peril
//!
//! `peril` is the messaging core of a small multiplayer strategy game whose
//! clients never talk to each other directly: every state change travels as
//! a message through an AMQP broker.
//!
//! ## Core Modules
//!
//! - `codec`: JSON and binary serialization adapters.
//! - `topology`: exchanges, queues, bindings and their durability classes.
//! - `broker`: the connection/channel seam, with an AMQP backend and an
//!   in-memory broker.
//! - `pubsub`: typed publishing, subscriptions and the dispatch loop that
//!   turns handler decisions into acks and nacks.
//! - `routing`: the game's message kinds and their routing contract.
//! - `config`: layered configuration loading.
//! - `persistence`: the server-side game-log store.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod codec;
pub mod config;
pub mod persistence;
pub mod pubsub;
pub mod routing;
pub mod topology;
pub mod utils;

pub use pubsub::AckType;
pub use utils::{PubSubError, Result};
