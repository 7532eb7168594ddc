use serde::Serialize;
use tracing::debug;

use crate::broker::Channel;
use crate::codec::Encoding;
use crate::utils::{PubSubError, Result};

/// Encode `value` and publish it to `exchange` under `routing_key`.
///
/// Returns as soon as the broker has the message; no consumer is awaited and
/// nothing is retried here. On an encode error nothing is sent.
pub async fn publish<T: Serialize + ?Sized>(
    channel: &dyn Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    encoding: Encoding,
) -> Result<()> {
    let payload = encoding.encode(value).map_err(PubSubError::Encode)?;
    let size = payload.len();
    channel
        .publish(exchange, routing_key, encoding.content_type(), payload)
        .await?;
    debug!(%exchange, %routing_key, size, "published");
    Ok(())
}

pub async fn publish_json<T: Serialize + ?Sized>(
    channel: &dyn Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()> {
    publish(channel, exchange, routing_key, value, Encoding::Json).await
}

pub async fn publish_binary<T: Serialize + ?Sized>(
    channel: &dyn Channel,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()> {
    publish(channel, exchange, routing_key, value, Encoding::Binary).await
}
