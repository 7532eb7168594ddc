//! The `utils` module provides the pieces shared by every other module:
//! the error taxonomy and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{CodecError, PubSubError, Result, TopologyError};

#[cfg(test)]
mod tests;
