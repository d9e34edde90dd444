//! Implements [`Manager`] for broker channels.
use crate::amqp::transport::{ChannelOf, Transport, TransportChannel, TransportConnection};
use crate::error::{BrokerError, Operation};
use crate::pool::connection::ConnectionManager;
use deadpool::managed::{self, Manager, Object};
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Prefetch count applied to every channel handed out by the pool.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// A channel, tagged with the generation of the connection it was created from.
pub struct GenerationalChannel<C> {
    generation: u64,
    channel: C,
}

impl<C> GenerationalChannel<C> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// `ChannelManager` implements [`Manager`] to manage a pool of channels.
///
/// Channels are always opened from the live connection of the [`ConnectionManager`].
/// A channel is recycled only if it is still open and its connection has not been replaced.
pub struct ChannelManager<T: Transport> {
    connection_manager: Arc<ConnectionManager<T>>,
}

impl<T: Transport> ChannelManager<T> {
    pub fn new(connection_manager: Arc<ConnectionManager<T>>) -> Self {
        Self { connection_manager }
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection_manager
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ChannelManager<T> {
    type Type = GenerationalChannel<ChannelOf<T>>;
    type Error = BrokerError;

    /// Waits for connectivity, then opens a fresh channel with the default QoS.
    async fn create(&self) -> Result<Self::Type, BrokerError> {
        let (generation, connection) = self.connection_manager.wait_until_connected().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::operation(Operation::OpenChannel, e))?;
        channel
            .qos(DEFAULT_PREFETCH_COUNT, false)
            .await
            .map_err(|e| BrokerError::operation(Operation::OpenChannel, e))?;
        debug!(generation, "Opened a new channel");
        Ok(GenerationalChannel {
            generation,
            channel,
        })
    }

    async fn recycle(&self, obj: &mut Self::Type) -> managed::RecycleResult<BrokerError> {
        if !obj.channel.is_open() {
            debug!(generation = obj.generation, "Discarding a closed channel");
            return Err(managed::RecycleError::Message("Channel is closed".into()));
        }
        if !self.connection_manager.is_current(obj.generation) {
            debug!(generation = obj.generation, "Discarding a channel of a stale connection");
            return Err(managed::RecycleError::Message(format!(
                "Channel belongs to a replaced connection (generation {})",
                obj.generation
            )));
        }
        Ok(())
    }
}

/// A channel checked out of the [`ChannelPool`](crate::pool::ChannelPool).
///
/// Dropping it gives the channel back to the pool, unless the channel is closed or its
/// connection has been replaced: in that case it is discarded.
pub struct PooledChannel<T: Transport> {
    object: Option<Object<ChannelManager<T>>>,
    connection_manager: Arc<ConnectionManager<T>>,
}

impl<T: Transport> PooledChannel<T> {
    pub(crate) fn new(
        object: Object<ChannelManager<T>>,
        connection_manager: Arc<ConnectionManager<T>>,
    ) -> Self {
        Self {
            object: Some(object),
            connection_manager,
        }
    }

    /// The generation of the connection this channel was opened from.
    pub fn generation(&self) -> u64 {
        self.object
            .as_ref()
            .map_or(0, |object| object.generation)
    }

    /// Remove the channel from the pool for good.
    pub fn discard(mut self) {
        if let Some(object) = self.object.take() {
            drop(Object::take(object));
        }
    }
}

impl<T: Transport> Deref for PooledChannel<T> {
    type Target = ChannelOf<T>;

    fn deref(&self) -> &Self::Target {
        match &self.object {
            Some(object) => &object.channel,
            // `object` is only taken by `discard` and `drop`, both consuming `self`.
            None => unreachable!("pooled channel used after being released"),
        }
    }
}

impl<T: Transport> Drop for PooledChannel<T> {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        if !object.channel.is_open() {
            debug!(generation = object.generation, "Dropping a closed channel");
            drop(Object::take(object));
        } else if !self.connection_manager.is_current(object.generation) {
            debug!(generation = object.generation, "Dropping a channel of a stale connection");
            drop(Object::take(object));
        }
        // Otherwise `object` goes back to the idle set when it falls out of scope.
    }
}
