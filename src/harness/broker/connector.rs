use super::config::BrokerConnectionConfig;
use super::embedded::{BrokerStartupError, EmbeddedBroker};
use crate::constants::destinations::REQUIRED;
use crate::library::communication::implementation::redis::{
    RedisPublisher, RedisSubscriptionProvider,
};
use crate::library::communication::{
    CommunicationFactory, Destination, DestinationNotFoundError, DestinationResolver,
};
use crate::library::helpers::{RetryError, RetryPolicy};
use lazy_static::lazy_static;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

lazy_static! {
    /// Embedded broker of this process, the lock serializes its startup
    ///
    /// Only a weak reference is kept so the broker stops once the last connector using it is gone.
    static ref EMBEDDED_BROKER: tokio::sync::Mutex<Weak<EmbeddedBroker>> =
        tokio::sync::Mutex::new(Weak::new());
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Broker connection could not be established
#[derive(Debug, Error)]
pub enum BrokerConnectionError {
    /// A destination required by this crate is missing from the configuration
    #[error("broker configuration is incomplete")]
    Destination(#[from] DestinationNotFoundError),
    /// Host name of the broker could not be resolved
    #[error("unable to resolve broker address {address}")]
    Resolve {
        /// Configured address
        address: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },
    /// No broker was listening and none could be started
    #[error("no broker reachable at {address} and embedded broker failed to start")]
    Startup {
        /// Configured address
        address: String,
        /// Underlying cause
        #[source]
        source: BrokerStartupError,
    },
    /// Broker did not accept the connection
    #[error("unable to connect to broker at {address}")]
    Unreachable {
        /// Effective address
        address: String,
        /// Error of the final attempt
        #[source]
        source: RetryError<RedisError>,
    },
}

/// Handle to a broker connection, possibly backed by an embedded broker
///
/// The connector owns one multiplexed connection shared by every publisher it hands out.
/// At most one embedded broker runs per process. Every connector to a loopback address uses it
/// once it is running, and it stops when the last of them is closed or dropped.
pub struct BrokerConnector {
    config: BrokerConnectionConfig,
    client: Client,
    con: MultiplexedConnection,
    embedded: Mutex<Option<Arc<EmbeddedBroker>>>,
    started_embedded: bool,
    closed: AtomicBool,
}

/// Embedded broker a connector ended up with
struct LocalBroker {
    broker: Arc<EmbeddedBroker>,
    started: bool,
}

impl BrokerConnector {
    /// Connects to the configured broker, starting an embedded one on loopback addresses if nobody listens
    #[instrument(skip(config), fields(address = %config.address()))]
    pub async fn connect(config: BrokerConnectionConfig) -> Result<Self, BrokerConnectionError> {
        config.destinations.ensure(&REQUIRED)?;

        let mut config = config;
        let embedded = if config.is_loopback() {
            Self::ensure_local_broker(&mut config).await?
        } else {
            None
        };

        let client = Client::open(config.connection_info()).map_err(|e| {
            BrokerConnectionError::Unreachable {
                address: config.address(),
                source: RetryError::Aborted {
                    attempts: 0,
                    error: e,
                },
            }
        })?;

        let policy = RetryPolicy::new(config.connection_retries + 1, CONNECT_RETRY_DELAY);
        let con = policy
            .execute(
                || async {
                    match timeout(CONNECT_TIMEOUT, client.get_multiplexed_tokio_connection()).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(RedisError::from(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection attempt timed out",
                        ))),
                    }
                },
                is_transient,
            )
            .await
            .map_err(|source| BrokerConnectionError::Unreachable {
                address: config.address(),
                source,
            })?;

        info!(
            address = %config.address(),
            embedded = embedded.is_some(),
            "Connected to broker"
        );

        let started_embedded = embedded.as_ref().map_or(false, |local| local.started);

        Ok(Self {
            config,
            client,
            con,
            embedded: Mutex::new(embedded.map(|local| local.broker)),
            started_embedded,
            closed: AtomicBool::new(false),
        })
    }

    /// Reuses the embedded broker of this process, or probes the local address and starts one when nobody answers
    async fn ensure_local_broker(
        config: &mut BrokerConnectionConfig,
    ) -> Result<Option<LocalBroker>, BrokerConnectionError> {
        let mut shared = EMBEDDED_BROKER.lock().await;
        let running = shared
            .upgrade()
            .and_then(|broker| broker.local_addr().map(|address| (broker, address)));

        if config.port != 0 && probe(config).await {
            if let Some((broker, address)) = running {
                if address.port() == config.port {
                    debug!(%address, "Embedded broker of this process is listening on the address");
                    return Ok(Some(LocalBroker {
                        broker,
                        started: false,
                    }));
                }
            }

            debug!("Broker already listening on loopback address");
            return Ok(None);
        }

        if let Some((broker, address)) = running {
            debug!(%address, requested = %config.address(), "Reusing embedded broker of this process");
            point_to(config, address);

            return Ok(Some(LocalBroker {
                broker,
                started: false,
            }));
        }

        let requested = resolve(config).await?;
        let broker = Arc::new(EmbeddedBroker::new(requested, config.dynamic_binding));

        match broker.start().await {
            Ok(address) => {
                point_to(config, address);

                if !probe(config).await {
                    warn!(%address, "Embedded broker did not answer the initial probe");
                }

                *shared = Arc::downgrade(&broker);

                Ok(Some(LocalBroker {
                    broker,
                    started: true,
                }))
            }
            Err(source) => {
                // Somebody else may have grabbed the port in the meantime
                if probe(config).await {
                    warn!(error = %source, "Embedded broker failed to start but a broker appeared on the address");
                    Ok(None)
                } else {
                    Err(BrokerConnectionError::Startup {
                        address: config.address(),
                        source,
                    })
                }
            }
        }
    }

    /// Effective `host:port` of the broker
    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Effective configuration, reflecting a dynamically chosen port
    pub fn config(&self) -> &BrokerConnectionConfig {
        &self.config
    }

    /// Whether this connector started the embedded broker of this process
    pub fn owns_embedded_broker(&self) -> bool {
        self.started_embedded
    }

    /// Whether this connector keeps the embedded broker of this process alive
    pub fn uses_embedded_broker(&self) -> bool {
        self.embedded
            .lock()
            .map(|embedded| embedded.is_some())
            .unwrap_or(false)
    }

    /// Releases this connector's share of the embedded broker, safe to call repeatedly
    ///
    /// The broker stops once no other connector uses it. Brokers started elsewhere are never stopped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let embedded = match self.embedded.lock() {
            Ok(mut embedded) => embedded.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(broker) = embedded {
            match Arc::try_unwrap(broker) {
                Ok(broker) => broker.stop(),
                Err(_) => debug!("Embedded broker still in use by other connectors"),
            }
        }

        debug!(address = %self.config.address(), "Broker connector closed");
    }
}

impl DestinationResolver for BrokerConnector {
    fn lookup(&self, name: &str) -> Result<Destination, DestinationNotFoundError> {
        self.config.destinations.lookup(name)
    }
}

impl CommunicationFactory for BrokerConnector {
    type NotificationPublisher = RedisPublisher;
    type SubscriptionProvider = RedisSubscriptionProvider;

    fn notification_publisher(&self) -> Self::NotificationPublisher {
        RedisPublisher::new(self.con.clone())
    }

    fn subscription_provider(&self) -> Self::SubscriptionProvider {
        RedisSubscriptionProvider::new(self.client.clone())
    }
}

/// Makes the configuration point at the address a local broker listens on
fn point_to(config: &mut BrokerConnectionConfig, address: SocketAddr) {
    if !address.ip().is_unspecified() {
        config.host = match address {
            SocketAddr::V4(address) => address.ip().to_string(),
            SocketAddr::V6(address) => format!("[{}]", address.ip()),
        };
    }

    config.port = address.port();
}

fn is_transient(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_refusal() || error.is_timeout()
}

async fn resolve(config: &BrokerConnectionConfig) -> Result<SocketAddr, BrokerConnectionError> {
    let host = config.host.trim_start_matches('[').trim_end_matches(']');
    let to_error = |source| BrokerConnectionError::Resolve {
        address: config.address(),
        source,
    };

    let candidates: Vec<SocketAddr> = lookup_host((host, config.port))
        .await
        .map_err(to_error)?
        .collect();

    candidates
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| {
            to_error(io::Error::new(
                io::ErrorKind::NotFound,
                "host resolved to no addresses",
            ))
        })
}

/// Whether something speaking the broker protocol answers on the configured address
async fn probe(config: &BrokerConnectionConfig) -> bool {
    let attempt = async {
        let client = Client::open(config.connection_info())?;
        let mut con = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut con).await
    };

    match timeout(PROBE_TIMEOUT, attempt).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(error = %e, address = %config.address(), "Broker probe failed");
            false
        }
        Err(_) => {
            debug!(address = %config.address(), "Broker probe timed out");
            false
        }
    }
}
