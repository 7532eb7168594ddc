//! Serialization adapters.
//!
//! Two encodings travel over the broker:
//! - `Encoding::Json`: structural text, used for gameplay and control
//!   messages that other implementations (and humans) need to read.
//! - `Encoding::Binary`: compact `bincode`, used for log records.
//!
//! Each message carries the content-type tag of the encoding that produced
//! it. Subscribers pick their decoder by convention (the publish path they
//! pair with), never by sniffing the tag.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::CodecError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BINARY: &str = "application/x-bincode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    Binary,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Json => CONTENT_TYPE_JSON,
            Encoding::Binary => CONTENT_TYPE_BINARY,
        }
    }

    /// Map a content-type tag back to its encoding, for diagnostics only.
    pub fn from_content_type(tag: &str) -> Option<Self> {
        match tag {
            CONTENT_TYPE_JSON => Some(Encoding::Json),
            CONTENT_TYPE_BINARY => Some(Encoding::Binary),
            _ => None,
        }
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::Binary => Ok(bincode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}
