use super::error::{CodecError, PubSubError, TopologyError};
use super::logging;
use crate::topology::{ExchangeKind, QueueType};

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
    logging::init("nonsense");
}

#[test]
fn topology_errors_convert_into_pubsub_errors() {
    let err: PubSubError = TopologyError::QueueMismatch {
        name: "war".to_string(),
        existing: QueueType::Durable,
        requested: QueueType::Transient,
    }
    .into();
    assert!(matches!(err, PubSubError::Topology(TopologyError::QueueMismatch { .. })));
    assert!(err.to_string().contains("war"));
}

#[test]
fn malformed_key_message_names_exchange_kind() {
    let err = TopologyError::MalformedBindingKey {
        key: "pause.*".to_string(),
        kind: ExchangeKind::Direct,
        reason: "wildcards are not allowed",
    };
    assert_eq!(
        err.to_string(),
        "binding key 'pause.*' is malformed for a direct exchange: wildcards are not allowed"
    );
}

#[test]
fn codec_errors_wrap_serde_json() {
    let json_err = serde_json::from_str::<bool>("nope").unwrap_err();
    let err = PubSubError::Decode(CodecError::from(json_err));
    assert!(err.to_string().starts_with("decode error: json:"));
}
