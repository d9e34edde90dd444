//! Owns the single live connection and replaces it when the broker drops it.
use crate::amqp::configuration::ReconnectSettings;
use crate::amqp::transport::{Transport, TransportConnection};
use crate::error::{BrokerError, Operation};
use crate::pool::backoff::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Where the connection manager stands.
///
/// Transitions are broadcast to every waiter through a [`watch`] channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A live connection is installed. `generation` is bumped on every (re)connect.
    Connected { generation: u64 },
    /// The connection was lost and the reconnect loop is dialing.
    Disconnected,
    /// [`ConnectionManager::close`] was called: no more reconnecting.
    Closed,
}

struct Live<C> {
    generation: u64,
    connection: Arc<C>,
}

/// `ConnectionManager` maintains at most one live connection to the broker.
///
/// The connection is never mutated: every reconnect installs a brand-new one, under the lock,
/// and bumps the generation number.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    live: Mutex<Option<Live<T::Connection>>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    reconnect: ReconnectSettings,
    reconnect_attempts: AtomicU64,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, reconnect: ReconnectSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
            reconnect,
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// How many times the reconnect loop has dialed the broker so far.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// `true` if `generation` identifies the connection currently installed.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state() == ConnectionState::Connected { generation }
    }

    /// Dial the broker and install the new connection.
    ///
    /// Every task waiting for connectivity is woken up on success.
    /// On failure the error is returned: the caller decides whether to retry.
    #[tracing::instrument(name = "connection_manager_connect", skip(self))]
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if self.state() == ConnectionState::Closed {
            return Err(BrokerError::PoolClosed);
        }
        let connection = Arc::new(
            self.transport
                .connect()
                .await
                .map_err(BrokerError::Connect)?,
        );

        let installed = {
            let mut live = self.live.lock();
            if self.state() == ConnectionState::Closed {
                false
            } else {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *live = Some(Live {
                    generation,
                    connection: Arc::clone(&connection),
                });
                self.state
                    .send_replace(ConnectionState::Connected { generation });
                info!(generation, "Connected to RabbitMq");
                true
            }
        };

        if !installed {
            // `close` won the race: this connection must not outlive the manager.
            if let Err(e) = connection.close().await {
                warn!(error = ?e, "Failed to close a connection dialed while shutting down");
            }
            return Err(BrokerError::PoolClosed);
        }
        Ok(())
    }

    /// The live connection, with its generation.
    pub(crate) fn live_connection(&self) -> Option<(u64, Arc<T::Connection>)> {
        self.live
            .lock()
            .as_ref()
            .map(|live| (live.generation, Arc::clone(&live.connection)))
    }

    /// Wait until a live connection is available.
    ///
    /// Fails fast with [`BrokerError::PoolClosed`] once the manager has been closed,
    /// including for tasks that were already waiting.
    pub(crate) async fn wait_until_connected(
        &self,
    ) -> Result<(u64, Arc<T::Connection>), BrokerError> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Closed => return Err(BrokerError::PoolClosed),
                ConnectionState::Connected { generation } => {
                    // A connection reported dead is about to be replaced by the reconnect loop.
                    if let Some((live_generation, connection)) = self.live_connection() {
                        if live_generation == generation && connection.is_connected() {
                            return Ok((generation, connection));
                        }
                    }
                }
                ConnectionState::Disconnected => {}
            }
            if state.changed().await.is_err() {
                return Err(BrokerError::PoolClosed);
            }
        }
    }

    /// Forget the connection of the given generation, if it is still the live one.
    fn mark_disconnected(&self, generation: u64) -> bool {
        let mut live = self.live.lock();
        let is_live = live
            .as_ref()
            .map_or(false, |live| live.generation == generation);
        if !is_live || self.state() == ConnectionState::Closed {
            return false;
        }
        *live = None;
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    /// Stop reconnecting, wake every waiter and close the live connection, if any.
    ///
    /// Calling `close` more than once is a no-op.
    #[tracing::instrument(name = "connection_manager_close", skip(self))]
    pub async fn close(&self) -> Result<(), BrokerError> {
        let live = {
            let mut live = self.live.lock();
            if self.state() == ConnectionState::Closed {
                return Ok(());
            }
            self.state.send_replace(ConnectionState::Closed);
            live.take()
        };

        match live {
            Some(live) if live.connection.is_connected() => live
                .connection
                .close()
                .await
                .map_err(|e| BrokerError::operation(Operation::Close, e)),
            _ => Ok(()),
        }
    }

    /// The reconnect loop.
    ///
    /// Waits for the live connection to be lost, then dials the broker with exponential
    /// backoff until it succeeds, forever. It only returns once the manager is closed.
    pub(crate) async fn handle_reconnect(self: Arc<Self>) {
        let mut state = self.state.subscribe();
        loop {
            if let Some((generation, connection)) = self.live_connection() {
                let reason = tokio::select! {
                    reason = connection.closed() => reason,
                    _ = wait_for_closed(&mut state) => return,
                };
                drop(connection);

                if !self.mark_disconnected(generation) {
                    if self.state() == ConnectionState::Closed {
                        return;
                    }
                    continue;
                }
                warn!(generation, %reason, "Connection to RabbitMq lost");
            } else if self.state() == ConnectionState::Closed {
                return;
            }

            if self.reconnect_with_backoff(&mut state).await.is_err() {
                return;
            }
        }
    }

    async fn reconnect_with_backoff(
        &self,
        state: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), BrokerError> {
        let mut backoff = Backoff::from(&self.reconnect);
        loop {
            let delay = backoff.next_delay();
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(attempt, backoff_ms = delay.as_millis() as u64, "Attempting to reconnect to RabbitMq");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_closed(state) => return Err(BrokerError::PoolClosed),
            }

            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to RabbitMq");
                    return Ok(());
                }
                Err(BrokerError::PoolClosed) => return Err(BrokerError::PoolClosed),
                Err(e) => warn!(attempt, error = ?e, "Failed to reconnect to RabbitMq"),
            }
        }
    }
}

async fn wait_for_closed(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
