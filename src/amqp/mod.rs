//! Helpers for connecting to a rabbitmq broker

mod channel;
pub mod configuration;
mod factory;
pub mod transport;

pub use channel::Channel;
pub use factory::{Connection, ConnectionFactory};

pub use lapin::{options, types, BasicProperties, ExchangeKind};
