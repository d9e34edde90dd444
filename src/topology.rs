//! Declarative exchanges, queues and bindings, declared once when the broker is built.
use crate::amqp::transport::Transport;
use crate::broker::Broker;
use crate::error::BrokerError;
use serde::Deserialize;
use tracing::info;

/// The exchanges, queues and bindings an application expects to find on the broker.
///
/// Declarations are idempotent on the broker side: applying the same topology twice is a
/// no-op, while redeclaring an entity with different flags fails.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Topology {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub binds: Vec<BindingDefinition>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    /// `direct`, `fanout`, `topic` or `headers`.
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BindingDefinition {
    pub queue_name: String,
    pub exchange_name: String,
    #[serde(default)]
    pub routing_key: String,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.binds.is_empty()
    }

    pub fn exchange(mut self, name: &str, kind: &str, durable: bool) -> Self {
        self.exchanges.push(ExchangeDefinition {
            name: name.into(),
            kind: kind.into(),
            durable,
        });
        self
    }

    pub fn queue(mut self, name: &str, durable: bool) -> Self {
        self.queues.push(QueueDefinition {
            name: name.into(),
            durable,
        });
        self
    }

    pub fn bind(mut self, queue_name: &str, exchange_name: &str, routing_key: &str) -> Self {
        self.binds.push(BindingDefinition {
            queue_name: queue_name.into(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// Declare exchanges, then queues, then bindings.
    ///
    /// Stops at the first failure.
    #[tracing::instrument(
        name = "topology_apply",
        skip_all,
        fields(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            binds = self.binds.len()
        )
    )]
    pub async fn apply<T: Transport>(&self, broker: &Broker<T>) -> Result<(), BrokerError> {
        for exchange in &self.exchanges {
            broker
                .create_exchange(&exchange.name, &exchange.kind, exchange.durable)
                .await?;
        }
        for queue in &self.queues {
            broker.create_queue(&queue.name, queue.durable).await?;
        }
        for bind in &self.binds {
            broker
                .bind_queue_to_exchange(&bind.queue_name, &bind.exchange_name, &bind.routing_key)
                .await?;
        }
        if !self.is_empty() {
            info!("Topology declared");
        }
        Ok(())
    }
}
