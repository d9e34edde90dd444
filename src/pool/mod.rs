//! Provides pooling for broker channels on top of a single, self-healing connection.
//!
//! This module provides three key guarantees:
//! - Callers never share a channel: each [`ChannelPool::get`] hands out a channel nobody else holds.
//! - Broken channels, and channels of a connection that has been replaced, are never reused.
//! - While the connection is down, [`ChannelPool::get`] waits for the reconnect loop instead
//!   of failing. Only [`ChannelPool::close`] makes it fail fast.
//!
//! ```rust,no_run
//! use hutch::amqp::configuration::BrokerSettings;
//! use hutch::amqp::ConnectionFactory;
//! use hutch::pool::ChannelPool;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = BrokerSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!
//!     let pool = ChannelPool::connect(factory, &settings).await?;
//!
//!     // the channel goes back to the pool when dropped.
//!     let channel = pool.get().await?;
//!     drop(channel);
//!
//!     pool.close().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod channel;
mod connection;

pub use backoff::Backoff;
pub use channel::{ChannelManager, GenerationalChannel, PooledChannel, DEFAULT_PREFETCH_COUNT};
pub use connection::{ConnectionManager, ConnectionState};

use crate::amqp::configuration::{BrokerSettings, ReconnectSettings};
use crate::amqp::transport::Transport;
use crate::error::BrokerError;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A snapshot of the pool, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Channels currently alive, idle or checked out.
    pub size: usize,
    /// Channels sitting idle, ready to be handed out.
    pub idle: usize,
    pub connection: ConnectionState,
    pub reconnect_attempts: u64,
}

/// `ChannelPool` hands out ready-to-use channels while hiding connection churn from callers.
///
/// It owns the reconnect loop: the background task is aborted when the last clone of the
/// pool is dropped.
pub struct ChannelPool<T: Transport> {
    channels: deadpool::managed::Pool<ChannelManager<T>>,
    connection_manager: Arc<ConnectionManager<T>>,
    reconnect_task: Arc<ReconnectTask>,
}

impl<T: Transport> Clone for ChannelPool<T> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
            connection_manager: Arc::clone(&self.connection_manager),
            reconnect_task: Arc::clone(&self.reconnect_task),
        }
    }
}

struct ReconnectTask(JoinHandle<()>);

impl Drop for ReconnectTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T: Transport> ChannelPool<T> {
    /// Dial the broker, start the reconnect loop and build the pool.
    ///
    /// Fails if the first connection attempt fails: retrying at startup is up to the caller.
    pub async fn connect(transport: T, settings: &BrokerSettings) -> Result<Self, BrokerError> {
        Self::connect_with(
            transport,
            settings.reconnect.clone(),
            settings.pool.max_channels,
        )
        .await
    }

    /// Same as [`ChannelPool::connect`], with explicit reconnect settings and pool size.
    ///
    /// `max_channels` bounds how many channels can be checked out at once: further calls
    /// to [`ChannelPool::get`] wait for a channel to be given back.
    pub async fn connect_with(
        transport: T,
        reconnect: ReconnectSettings,
        max_channels: usize,
    ) -> Result<Self, BrokerError> {
        let connection_manager = Arc::new(ConnectionManager::new(transport, reconnect));
        let channels = deadpool::managed::Pool::builder(ChannelManager::new(Arc::clone(
            &connection_manager,
        )))
        .max_size(max_channels)
        .build()
        .map_err(|e| BrokerError::Connect(anyhow::anyhow!(e.to_string())))?;

        connection_manager.connect().await?;
        let reconnect_task = ReconnectTask(tokio::spawn(
            Arc::clone(&connection_manager).handle_reconnect(),
        ));

        Ok(Self {
            channels,
            connection_manager,
            reconnect_task: Arc::new(reconnect_task),
        })
    }

    /// Get a channel.
    ///
    /// Waits while the connection is down and reconnection is still permitted.
    /// Returns [`BrokerError::PoolClosed`] immediately once the pool has been closed.
    pub async fn get(&self) -> Result<PooledChannel<T>, BrokerError> {
        if self.connection_manager.state() == ConnectionState::Closed {
            return Err(BrokerError::PoolClosed);
        }
        let object = self.channels.get().await?;
        Ok(PooledChannel::new(
            object,
            Arc::clone(&self.connection_manager),
        ))
    }

    /// Give a channel back.
    ///
    /// Infallible by contract: `None`, closed channels and channels of a replaced
    /// connection are silently dropped instead of being returned to the idle set.
    pub fn put(&self, channel: Option<PooledChannel<T>>) {
        drop(channel);
    }

    /// Stop reconnecting and close the connection.
    ///
    /// Every task waiting in [`ChannelPool::get`] wakes up with [`BrokerError::PoolClosed`].
    /// Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channels.close();
        self.connection_manager.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.connection_manager.state() == ConnectionState::Closed
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection_manager
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.channels.status();
        PoolStatus {
            size: status.size,
            idle: status.available.max(0) as usize,
            connection: self.connection_manager.state(),
            reconnect_attempts: self.connection_manager.reconnect_attempts(),
        }
    }
}
