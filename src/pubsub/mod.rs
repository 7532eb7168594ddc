//! Typed publish/subscribe
//!
//! - `AckType`: the three-way decision a handler returns
//! - `publish` / `publish_json` / `publish_binary`: encode and send, no waiting
//! - `subscribe` and friends: declare + bind the queue, then run one dispatch
//!   loop per subscription that decodes, calls the handler and settles the
//!   delivery according to its decision
//!
//! Delivery is at-least-once. `NackRequeue` has no retry cap: a handler that
//! always requeues keeps the message cycling until someone else acks it.

pub mod ack;
pub mod publisher;
pub mod subscriber;

pub use ack::AckType;
pub use publisher::{publish, publish_binary, publish_json};
pub use subscriber::{
    DEFAULT_PREFETCH, Dispatch, Subscription, subscribe, subscribe_binary, subscribe_dispatch,
    subscribe_json,
};
