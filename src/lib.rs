//! `hutch` keeps a single RabbitMq connection alive and multiplexes channels over it,
//! built on top of [`lapin`] and [`deadpool`].
//!
//! [`Broker`] is the best starting point: it declares exchanges, queues and bindings,
//! publishes, consumes and acknowledges messages. Each operation borrows a channel from the
//! [`ChannelPool`](crate::pool::ChannelPool) for the duration of a single attempt.
//!
//! When the broker drops the connection, a background task dials it again with exponential
//! backoff, forever, until the broker is closed. In the meantime operations wait for the
//! connection to come back instead of failing.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod broker;
pub mod error;
pub mod pool;
pub mod topology;

pub use broker::{Broker, BrokerBuilder, Delivery, DeliveryStream};
pub use error::{BrokerError, Operation};
pub use topology::Topology;
