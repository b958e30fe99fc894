//! In-process broker used when no external broker is reachable
//!
//! The broker speaks enough of the Redis protocol for the publish/subscribe
//! operations the rest of the crate performs, so the regular broker client can
//! talk to it without any special casing.

mod protocol;
mod server;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Lifecycle phase of an [`EmbeddedBroker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Created but never started
    Uninitialized,
    /// Binding the listener
    Starting,
    /// Accepting clients
    Running,
    /// Terminal, can not be started again
    Stopped,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Starting => "starting",
            BrokerState::Running => "running",
            BrokerState::Stopped => "stopped",
        };

        f.write_str(name)
    }
}

/// Embedded broker could not be brought up
#[derive(Debug, Error)]
pub enum BrokerStartupError {
    /// Listener could not be bound
    #[error("unable to bind embedded broker to {address}")]
    Bind {
        /// Requested listening address
        address: SocketAddr,
        /// Underlying cause
        #[source]
        source: io::Error,
    },
    /// Broker is not in a state that permits starting
    #[error("embedded broker can not be started while {0}")]
    InvalidState(BrokerState),
}

struct Inner {
    state: BrokerState,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Handle owning an in-process broker instance
///
/// Dropping the handle stops the broker and disconnects all of its clients.
pub struct EmbeddedBroker {
    requested: SocketAddr,
    dynamic_binding: bool,
    inner: Mutex<Inner>,
}

impl EmbeddedBroker {
    /// Creates a broker which will listen on the given address once started
    ///
    /// With `dynamic_binding` enabled an ephemeral port is used when the requested one is taken.
    pub fn new(requested: SocketAddr, dynamic_binding: bool) -> Self {
        Self {
            requested,
            dynamic_binding,
            inner: Mutex::new(Inner {
                state: BrokerState::Uninitialized,
                local_addr: None,
                shutdown: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain data so a poisoned lock is still consistent
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current lifecycle phase
    pub fn state(&self) -> BrokerState {
        self.inner().state
    }

    /// Address the broker is accepting clients on, if it is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner().local_addr
    }

    /// Binds the listener and starts accepting clients
    ///
    /// Resolves once the broker accepts connections and returns the address it listens on.
    #[instrument(skip(self), fields(address = %self.requested))]
    pub async fn start(&self) -> Result<SocketAddr, BrokerStartupError> {
        {
            let mut inner = self.inner();
            if inner.state != BrokerState::Uninitialized {
                return Err(BrokerStartupError::InvalidState(inner.state));
            }
            inner.state = BrokerState::Starting;
        }

        let bound = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.inner().state = BrokerState::Stopped;
                return Err(e);
            }
        };

        let (listener, address) = bound;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut inner = self.inner();
        if inner.state != BrokerState::Starting {
            // Stopped while binding
            return Err(BrokerStartupError::InvalidState(inner.state));
        }

        tokio::spawn(server::serve(listener, shutdown_rx));

        inner.state = BrokerState::Running;
        inner.local_addr = Some(address);
        inner.shutdown = Some(shutdown_tx);

        info!(%address, "Embedded broker running");

        Ok(address)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr), BrokerStartupError> {
        let listener = match TcpListener::bind(self.requested).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && self.dynamic_binding => {
                let mut fallback = self.requested;
                fallback.set_port(0);

                warn!(error = %e, "Requested broker port is taken, binding to an ephemeral port");

                TcpListener::bind(fallback)
                    .await
                    .map_err(|source| BrokerStartupError::Bind {
                        address: fallback,
                        source,
                    })?
            }
            Err(source) => {
                return Err(BrokerStartupError::Bind {
                    address: self.requested,
                    source,
                })
            }
        };

        let address = listener
            .local_addr()
            .map_err(|source| BrokerStartupError::Bind {
                address: self.requested,
                source,
            })?;

        Ok((listener, address))
    }

    /// Stops accepting clients and disconnects everybody, safe to call repeatedly
    pub fn stop(&self) {
        let mut inner = self.inner();

        if inner.state == BrokerState::Stopped {
            return;
        }

        if let Some(shutdown) = inner.shutdown.take() {
            shutdown.send(true).ok();
            info!(address = ?inner.local_addr, "Embedded broker stopped");
        }

        inner.state = BrokerState::Stopped;
        inner.local_addr = None;
    }
}

impl Drop for EmbeddedBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
