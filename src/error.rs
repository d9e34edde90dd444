use std::fmt;

/// Error returned by the [`Broker`](crate::broker::Broker) and the
/// [`ChannelPool`](crate::pool::ChannelPool).
///
/// Connection-level failures are recovered by the reconnect loop and never reach callers
/// that are willing to wait for a channel. Everything else bubbles up unchanged: no
/// operation is retried on your behalf.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
    #[error("The channel pool has been closed")]
    PoolClosed,
    #[error("Failed to {operation}")]
    Operation {
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },
    #[error("The timeout threshold was reached while trying to {0}")]
    Timeout(Operation),
}

impl BrokerError {
    pub(crate) fn operation(operation: Operation, source: impl Into<anyhow::Error>) -> Self {
        Self::Operation {
            operation,
            source: source.into(),
        }
    }

    /// `true` if the error was raised because the pool has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }

    /// The broker primitive that failed, if the error is tied to one.
    pub fn failed_operation(&self) -> Option<Operation> {
        match self {
            Self::Operation { operation, .. } | Self::Timeout(operation) => Some(*operation),
            Self::Connect(_) | Self::PoolClosed => None,
        }
    }
}

impl From<deadpool::managed::PoolError<BrokerError>> for BrokerError {
    fn from(err: deadpool::managed::PoolError<BrokerError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Closed => Self::PoolClosed,
            err => Self::operation(Operation::OpenChannel, anyhow::anyhow!(err.to_string())),
        }
    }
}

/// The broker primitive an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenChannel,
    CreateExchange,
    DeleteExchange,
    CreateQueue,
    DeleteQueue,
    BindQueue,
    UnbindQueue,
    Publish,
    Consume,
    CancelConsumer,
    Ack,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Self::OpenChannel => "open a channel",
            Self::CreateExchange => "create exchange",
            Self::DeleteExchange => "delete exchange",
            Self::CreateQueue => "create queue",
            Self::DeleteQueue => "delete queue",
            Self::BindQueue => "bind queue to exchange",
            Self::UnbindQueue => "unbind queue from exchange",
            Self::Publish => "publish message",
            Self::Consume => "consume messages",
            Self::CancelConsumer => "cancel consumer",
            Self::Ack => "ack message",
            Self::Close => "close the connection",
        };
        f.write_str(description)
    }
}
