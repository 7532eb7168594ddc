//! Subscriptions and the dispatch loop
//!
//! Every subscription owns one channel and one spawned task. The task pulls
//! deliveries in broker order, decodes each payload, awaits the handler and
//! settles the delivery before looking at the next one, so handlers of one
//! subscription never overlap. Separate subscriptions run independently.
//!
//! Undecodable payloads are settled with `NackDiscard`: they reach the
//! dead-letter queue when the queue has one and are never redelivered to the
//! same consumer. Closing the channel is the only way to stop a loop.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::AckType;
use crate::broker::{Channel, Connection, DeliveryStream};
use crate::codec::Encoding;
use crate::topology::{QueueBinding, declare_and_bind};
use crate::utils::{CodecError, Result};

/// Unacknowledged deliveries a subscription may hold at once.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Decodes a raw payload and runs the matching handler.
#[async_trait]
pub trait Dispatch: Send + 'static {
    async fn dispatch(&mut self, payload: &[u8]) -> Result<AckType, CodecError>;
}

/// A single payload type decoded with a fixed encoding.
struct Typed<T, F> {
    encoding: Encoding,
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Dispatch for Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    async fn dispatch(&mut self, payload: &[u8]) -> Result<AckType, CodecError> {
        let value: T = self.encoding.decode(payload)?;
        Ok((self.handler)(value).await)
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    queue: String,
    channel: Arc<dyn Channel>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the subscription's channel and wait for its loop to stop.
    pub async fn close(self) -> Result<()> {
        self.channel.close().await?;
        self.join().await;
        Ok(())
    }

    /// Wait for the loop to stop on its own (channel or connection closed).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(queue = %self.queue, "Dispatch loop aborted: {e}");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Declare and bind `binding`, then dispatch every delivery through `dispatcher`.
pub async fn subscribe_dispatch<D: Dispatch>(
    conn: &dyn Connection,
    binding: &QueueBinding,
    prefetch: u16,
    dispatcher: D,
) -> Result<Subscription> {
    let (channel, queue) = declare_and_bind(conn, binding).await?;

    let deliveries = match start_consumer(channel.as_ref(), &queue.name, prefetch).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!("Failed to close channel after consume error: {close_err}");
            }
            return Err(err);
        }
    };

    let task = tokio::spawn(dispatch_loop(
        queue.name.clone(),
        deliveries,
        dispatcher,
        channel.clone(),
    ));
    info!(queue = %queue.name, exchange = %binding.exchange, key = %binding.key, "subscribed");

    Ok(Subscription {
        queue: queue.name,
        channel,
        task,
    })
}

async fn start_consumer(
    channel: &dyn Channel,
    queue: &str,
    prefetch: u16,
) -> Result<DeliveryStream> {
    channel.set_prefetch(prefetch).await?;
    channel.consume(queue).await
}

/// Subscribe `handler` to `binding`, decoding payloads with `encoding`.
pub async fn subscribe<T, F, Fut>(
    conn: &dyn Connection,
    binding: &QueueBinding,
    encoding: Encoding,
    handler: F,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    let dispatcher = Typed {
        encoding,
        handler,
        _payload: PhantomData,
    };
    subscribe_dispatch(conn, binding, DEFAULT_PREFETCH, dispatcher).await
}

pub async fn subscribe_json<T, F, Fut>(
    conn: &dyn Connection,
    binding: &QueueBinding,
    handler: F,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    subscribe(conn, binding, Encoding::Json, handler).await
}

pub async fn subscribe_binary<T, F, Fut>(
    conn: &dyn Connection,
    binding: &QueueBinding,
    handler: F,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send + 'static,
{
    subscribe(conn, binding, Encoding::Binary, handler).await
}

pub(crate) async fn dispatch_loop<D: Dispatch>(
    queue: String,
    mut deliveries: DeliveryStream,
    mut dispatcher: D,
    channel: Arc<dyn Channel>,
) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(%queue, "Delivery stream failed: {e}");
                break;
            }
        };

        let decision = match dispatcher.dispatch(delivery.payload()).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    %queue,
                    routing_key = %delivery.routing_key(),
                    "Couldn't decode message, discarding: {e}"
                );
                AckType::NackDiscard
            }
        };

        debug!(%queue, ?decision, redelivered = delivery.redelivered(), "settling delivery");
        if let Err(e) = delivery.settle(decision).await {
            error!(%queue, "Failed to settle delivery: {e}");
            break;
        }
    }

    if let Err(e) = channel.close().await {
        debug!(%queue, "Channel already gone: {e}");
    }
    info!(%queue, "dispatch loop stopped");
}
