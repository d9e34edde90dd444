//! The seam between the pool and the wire.
//!
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) implements these traits on top of
//! `lapin`. Any other implementation (e.g. an in-memory broker for tests) can be plugged
//! into [`Broker::builder`](crate::broker::Broker::builder).
use crate::broker::Delivery;
use futures_util::stream::BoxStream;
use lapin::{BasicProperties, ExchangeKind};

/// Stream of deliveries pushed by the broker to a consumer.
pub type DeliveryFeed = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// The channel type produced by the connections of a [`Transport`].
pub type ChannelOf<T> = <<T as Transport>::Connection as TransportConnection>::Channel;

/// `Transport` knows how to dial a broker.
///
/// Each call to [`Transport::connect`] must return a brand-new connection: the
/// connection manager replaces connections wholesale, it never mutates them.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: TransportConnection;

    /// Dial the broker once.
    ///
    /// Implementations are expected to enforce their own connection timeout.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A live connection to the broker, shared by every channel created from it.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    type Channel: TransportChannel;

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    fn is_connected(&self) -> bool;

    /// Resolves, with the reason, once the connection has been lost.
    ///
    /// This is the closure notification the reconnect loop waits on.
    async fn closed(&self) -> String;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A logical channel multiplexed over a [`TransportConnection`].
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), anyhow::Error>;

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error>;

    async fn delete_exchange(&self, exchange: &str) -> Result<(), anyhow::Error>;

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), anyhow::Error>;

    async fn delete_queue(&self, queue: &str) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    /// Subscribe to `queue` with manual acknowledgements.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryFeed, anyhow::Error>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    /// Close the channel. Unacknowledged deliveries are requeued by the broker.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Parse the textual exchange kind used in topology descriptors.
///
/// Unknown kinds (including the empty string) are forwarded as
/// [`ExchangeKind::Custom`]: the broker is the one rejecting them.
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_owned()),
    }
}
