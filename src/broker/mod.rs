//! The broker façade: one call per broker primitive.
//!
//! Every operation follows the same pattern: take a channel from the
//! [`ChannelPool`], perform a single attempt, give the channel back.
//! Nothing is retried on your behalf: if a publish fails, retrying the business operation
//! is up to the caller.
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use hutch::amqp::configuration::BrokerSettings;
//! use hutch::Broker;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let broker = Broker::connect(&BrokerSettings::default()).await?;
//!
//!     broker.create_exchange("orders", "direct", true).await?;
//!     broker.create_queue("orders.high", true).await?;
//!     broker.bind_queue_to_exchange("orders.high", "orders", "high").await?;
//!
//!     broker.publish("orders", "high", true, br#"{"id": 1}"#).await?;
//!
//!     let mut deliveries = broker.consume("billing", "orders.high").await?;
//!     if let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         broker.ack(&delivery).await?;
//!     }
//!
//!     broker.close().await?;
//!     Ok(())
//! }
//! ```
mod delivery;

pub use delivery::{Acknowledger, Delivery, DeliveryStream};

use crate::amqp::configuration::{BrokerSettings, ReconnectSettings};
use crate::amqp::transport::{exchange_kind, Transport, TransportChannel};
use crate::amqp::ConnectionFactory;
use crate::error::{BrokerError, Operation};
use crate::pool::{ChannelPool, PoolStatus, DEFAULT_PREFETCH_COUNT};
use crate::topology::Topology;
use lapin::BasicProperties;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Content type set on every published message.
pub const CONTENT_TYPE: &str = "application/json";

const TRANSIENT: u8 = 1;
const PERSISTENT: u8 = 2;

/// The entrypoint to talk to the broker.
///
/// It is cheap to clone: clones share the same connection and channel pool.
pub struct Broker<T: Transport = ConnectionFactory> {
    pool: ChannelPool<T>,
    operation_timeout: Option<Duration>,
}

impl<T: Transport> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl Broker<ConnectionFactory> {
    /// Connect to the RabbitMq broker described by `settings`.
    ///
    /// The topology in `settings`, if any, is declared before returning.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let factory = ConnectionFactory::new_from_config(settings).map_err(BrokerError::Connect)?;
        Self::builder(factory).settings(settings).build().await
    }
}

impl<T: Transport> Broker<T> {
    /// Build a broker on top of a custom [`Transport`].
    pub fn builder(transport: T) -> BrokerBuilder<T> {
        BrokerBuilder {
            transport,
            reconnect: ReconnectSettings::default(),
            max_channels: crate::amqp::configuration::PoolSettings::default().max_channels,
            operation_timeout: None,
            topology: None,
        }
    }

    pub fn pool(&self) -> &ChannelPool<T> {
        &self.pool
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Declare an exchange.
    ///
    /// `kind` is one of `direct`, `fanout`, `topic` or `headers`. Anything else is forwarded
    /// as-is and it is up to the broker to accept it.
    #[tracing::instrument(name = "broker_create_exchange", skip(self))]
    pub async fn create_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let operation = Operation::CreateExchange;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .declare_exchange(name, exchange_kind(kind), durable)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    #[tracing::instrument(name = "broker_delete_exchange", skip(self))]
    pub async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let operation = Operation::DeleteExchange;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .delete_exchange(name)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    #[tracing::instrument(name = "broker_create_queue", skip(self))]
    pub async fn create_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let operation = Operation::CreateQueue;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .declare_queue(name, durable)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    #[tracing::instrument(name = "broker_delete_queue", skip(self))]
    pub async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let operation = Operation::DeleteQueue;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .delete_queue(name)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    #[tracing::instrument(name = "broker_bind_queue", skip(self))]
    pub async fn bind_queue_to_exchange(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let operation = Operation::BindQueue;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .bind_queue(queue, exchange, routing_key)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    #[tracing::instrument(name = "broker_unbind_queue", skip(self))]
    pub async fn unbind_queue_from_exchange(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let operation = Operation::UnbindQueue;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .unbind_queue(queue, exchange, routing_key)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    /// Publish `body` as a JSON message.
    ///
    /// The message is persistent if `durable` is `true`, transient otherwise.
    /// Unroutable messages are dropped by the broker.
    #[tracing::instrument(name = "broker_publish", skip(self, body), fields(body_len = body.len()))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        durable: bool,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let operation = Operation::Publish;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(if durable { PERSISTENT } else { TRANSIENT });
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            channel
                .publish(exchange, routing_key, body, properties)
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    /// Subscribe to `queue`, with manual acknowledgements and a prefetch count of 1.
    ///
    /// The returned stream keeps its channel until it is dropped or cancelled.
    #[tracing::instrument(name = "broker_consume", skip(self))]
    pub async fn consume(
        &self,
        consumer_name: &str,
        queue: &str,
    ) -> Result<DeliveryStream<T>, BrokerError> {
        let operation = Operation::Consume;
        self.deadline(operation, async {
            let channel = self.pool.get().await?;
            // Owned by the stream from now on: cancelled if we bail out below.
            let mut stream = DeliveryStream::pending(channel, consumer_name.to_owned());
            let feed = match stream.channel() {
                Some(channel) => {
                    channel
                        .qos(DEFAULT_PREFETCH_COUNT, false)
                        .await
                        .map_err(|e| BrokerError::operation(operation, e))?;
                    channel
                        .consume(queue, consumer_name)
                        .await
                        .map_err(|e| BrokerError::operation(operation, e))?
                }
                None => return Err(BrokerError::PoolClosed),
            };
            stream.subscribed(feed);
            Ok(stream)
        })
        .await
    }

    /// Acknowledge a single delivery.
    ///
    /// Earlier deliveries received on the same channel are not acknowledged.
    #[tracing::instrument(
        name = "broker_ack",
        skip(self, delivery),
        fields(delivery_tag = delivery.delivery_tag)
    )]
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let operation = Operation::Ack;
        if self.pool.is_closed() {
            return Err(BrokerError::PoolClosed);
        }
        self.deadline(operation, async {
            delivery
                .ack()
                .await
                .map_err(|e| BrokerError::operation(operation, e))
        })
        .await
    }

    /// Stop reconnecting and close the connection.
    ///
    /// Operations waiting for a channel fail with [`BrokerError::PoolClosed`].
    /// Closing an already closed broker is a no-op.
    #[tracing::instrument(name = "broker_close", skip(self))]
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.pool.close().await
    }

    async fn deadline<R, F>(&self, operation: Operation, future: F) -> Result<R, BrokerError>
    where
        F: Future<Output = Result<R, BrokerError>>,
    {
        match self.operation_timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| BrokerError::Timeout(operation))?,
            None => future.await,
        }
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder<T: Transport> {
    transport: T,
    reconnect: ReconnectSettings,
    max_channels: usize,
    operation_timeout: Option<Duration>,
    topology: Option<Topology>,
}

impl<T: Transport> BrokerBuilder<T> {
    /// Take reconnect, pool, timeout and topology options from `settings`.
    pub fn settings(mut self, settings: &BrokerSettings) -> Self {
        self.reconnect = settings.reconnect.clone();
        self.max_channels = settings.pool.max_channels;
        self.operation_timeout = settings.operation_timeout();
        self.topology = settings.topology.clone();
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectSettings) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// The maximum number of channels checked out at the same time.
    pub fn max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// Deadline applied to each operation, waiting for a channel included.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Exchanges, queues and bindings to declare before [`BrokerBuilder::build`] returns.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Connect to the broker and declare the topology.
    ///
    /// If the topology cannot be applied the broker is closed and the error returned.
    pub async fn build(self) -> Result<Broker<T>, BrokerError> {
        let pool =
            ChannelPool::connect_with(self.transport, self.reconnect, self.max_channels).await?;
        let broker = Broker {
            pool,
            operation_timeout: self.operation_timeout,
        };
        if let Some(topology) = self.topology {
            if let Err(e) = topology.apply(&broker).await {
                if let Err(close_error) = broker.close().await {
                    warn!(error = ?close_error, "Failed to close the broker after a topology failure");
                }
                return Err(e);
            }
        }
        Ok(broker)
    }
}
