//! [`TransportChannel`] on top of a [`lapin::Channel`].
use crate::amqp::transport::{DeliveryFeed, TransportChannel};
use crate::broker::Delivery;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};

/// A RabbitMq channel.
#[derive(Clone)]
pub struct Channel(lapin::Channel);

impl Channel {
    pub(crate) fn new(channel: lapin::Channel) -> Self {
        Self(channel)
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl TransportChannel for Channel {
    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), anyhow::Error> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        self.0
            .exchange_declare(exchange, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_delete_exchange", skip(self))]
    async fn delete_exchange(&self, exchange: &str) -> Result<(), anyhow::Error> {
        let options = ExchangeDeleteOptions {
            if_unused: false,
            nowait: false,
        };
        self.0.exchange_delete(exchange, options).await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };
        self.0
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_delete_queue", skip(self))]
    async fn delete_queue(&self, queue: &str) -> Result<(), anyhow::Error> {
        let options = QueueDeleteOptions {
            if_unused: false,
            if_empty: false,
            nowait: false,
        };
        self.0.queue_delete(queue, options).await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.0
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_unbind_queue", skip(self))]
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.0
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_publish", level = "debug", skip(self, payload))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let options = BasicPublishOptions {
            // Unroutable messages are silently dropped by the broker.
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        // Publisher confirms are not enabled on pooled channels: awaiting the confirm only
        // waits for the frames to be flushed.
        self.0
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryFeed, anyhow::Error> {
        let options = BasicConsumeOptions {
            no_local: false,
            // Every delivery must be acked explicitly.
            no_ack: false,
            exclusive: false,
            nowait: false,
        };
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        // 200 - REPLY_SUCCESS
        self.0.close(200, "closed by client").await?;
        Ok(())
    }
}
