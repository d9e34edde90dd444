use crate::amqp::channel::Channel;
use crate::amqp::configuration::BrokerSettings;
use crate::amqp::transport::{Transport, TransportConnection};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// `uri` plus the pool tunables, safe to log.
    dsn: String,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq")?;

                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        Ok(Self {
            uri: settings.amqp_uri(),
            dsn: settings.dsn(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// The connection string this factory dials, with the password masked.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self),
        fields(dsn = %self.dsn)
    )]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Timed out while trying to connect to RabbitMq."))?
        .context("Failed to connect to RabbitMq.")?;

        // The callback is the closure notification: it fires once when the connection breaks.
        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            closed_tx.send_replace(Some(e.to_string()));
        });
        Ok(Connection {
            inner: connection,
            closed: closed_rx,
        })
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, anyhow::Error> {
        self.new_connection().await
    }
}

/// A connection to a RabbitMq broker.
///
/// Connections should be shared across channels given the initial setup cost.
pub struct Connection {
    inner: lapin::Connection,
    closed: watch::Receiver<Option<String>>,
}

impl Connection {
    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl TransportConnection for Connection {
    type Channel = Channel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Channel, anyhow::Error> {
        Ok(Channel::new(self.inner.create_channel().await?))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = closed.borrow_and_update().clone() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return "the connection error callback was dropped".into();
            }
        }
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        // 200 - REPLY_SUCCESS
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants
        self.inner
            .close(200, "closed by client")
            .await
            .context("Failed to close the RabbitMq connection")
    }
}
