//! The `persistence` module stores the game logs collected by the server.
//!
//! Logs are kept in `sled`, one tree per player, keyed chronologically so a
//! scan returns them in the order they happened. Broker messages themselves
//! are never persisted here; the broker's own store is the only one.

pub mod log_store;

pub use log_store::GameLogStore;
