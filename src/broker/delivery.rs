use crate::amqp::transport::{DeliveryFeed, Transport, TransportChannel};
use crate::error::{BrokerError, Operation};
use crate::pool::PooledChannel;
use futures_util::{Stream, StreamExt};
use lapin::options::BasicAckOptions;
use lapin::BasicProperties;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Acknowledges deliveries on the channel they were received from.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, multiple: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Acknowledger for lapin::acker::Acker {
    async fn ack(&self, multiple: bool) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::ack(self, BasicAckOptions { multiple }).await?;
        Ok(())
    }
}

/// An inbound message handed to a consumer.
///
/// It must be acknowledged exactly once with [`Broker::ack`](crate::broker::Broker::ack),
/// otherwise the broker redelivers it once its channel is gone.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        }
    }

    pub(crate) async fn ack(&self) -> Result<(), anyhow::Error> {
        self.acker.ack(false).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            acker: Arc::new(delivery.acker),
        }
    }
}

/// The deliveries of a consumer, in the order the broker pushes them.
///
/// The stream owns the channel the consumer lives on. It ends when the broker cancels the
/// consumer, or right after yielding the first error (e.g. the connection was lost):
/// call [`Broker::consume`](crate::broker::Broker::consume) again to resume consuming.
///
/// Dropping the stream cancels the consumer in the background.
/// A stream that never subscribed leaves its channel to the pool.
pub struct DeliveryStream<T: Transport> {
    consumer_tag: String,
    channel: Option<PooledChannel<T>>,
    feed: Option<DeliveryFeed>,
    done: bool,
}

impl<T: Transport> fmt::Debug for DeliveryStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("consumer_tag", &self.consumer_tag)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

// No field is ever pinned: the feed is boxed.
impl<T: Transport> Unpin for DeliveryStream<T> {}

impl<T: Transport> DeliveryStream<T> {
    /// A stream that owns `channel` but is not subscribed yet.
    pub(crate) fn pending(channel: PooledChannel<T>, consumer_tag: String) -> Self {
        Self {
            consumer_tag,
            channel: Some(channel),
            feed: None,
            done: false,
        }
    }

    pub(crate) fn channel(&self) -> Option<&PooledChannel<T>> {
        self.channel.as_ref()
    }

    pub(crate) fn subscribed(&mut self, feed: DeliveryFeed) {
        self.feed = Some(feed);
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancel the consumer and release its channel.
    ///
    /// The channel is discarded rather than reused: deliveries that were received but not
    /// acknowledged yet are requeued by the broker once the channel is closed.
    #[tracing::instrument(name = "broker_cancel_consumer", skip(self), fields(consumer_tag = %self.consumer_tag))]
    pub async fn cancel(mut self) -> Result<(), BrokerError> {
        let subscribed = self.feed.take().is_some();
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };
        if !subscribed {
            // No consumer to cancel: the channel goes back to the pool.
            return Ok(());
        }
        cancel_consumer(channel, &self.consumer_tag).await
    }
}

async fn cancel_consumer<T: Transport>(
    channel: PooledChannel<T>,
    consumer_tag: &str,
) -> Result<(), BrokerError> {
    let outcome = if channel.is_open() {
        let cancelled = channel.cancel(consumer_tag).await;
        if let Err(e) = channel.close().await {
            debug!(%consumer_tag, error = ?e, "Failed to close a consumer channel");
        }
        cancelled.map_err(|e| BrokerError::operation(Operation::CancelConsumer, e))
    } else {
        Ok(())
    };
    channel.discard();
    outcome
}

impl<T: Transport> Stream for DeliveryStream<T> {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let Some(feed) = this.feed.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match feed.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(delivery))) => Poll::Ready(Some(Ok(delivery))),
            Poll::Ready(Some(Err(e))) => {
                warn!(consumer_tag = %this.consumer_tag, error = ?e, "Consumer stream failed");
                this.done = true;
                Poll::Ready(Some(Err(BrokerError::operation(Operation::Consume, e))))
            }
            Poll::Ready(None) => {
                debug!(consumer_tag = %this.consumer_tag, "Consumer cancelled by the broker");
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T: Transport> Drop for DeliveryStream<T> {
    fn drop(&mut self) {
        let subscribed = self.feed.take().is_some();
        let Some(channel) = self.channel.take() else {
            return;
        };
        // Never subscribed, e.g. `consume` bailed out: put the channel back as is.
        if !subscribed {
            return;
        }
        if !channel.is_open() {
            channel.discard();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let consumer_tag = std::mem::take(&mut self.consumer_tag);
                handle.spawn(async move {
                    if let Err(e) = cancel_consumer(channel, &consumer_tag).await {
                        warn!(%consumer_tag, error = ?e, "Failed to cancel a dropped consumer");
                    }
                });
            }
            // Without a runtime there is no way to cancel: the channel must not be reused.
            Err(_) => channel.discard(),
        }
    }
}
