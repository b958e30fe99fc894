//! Acquisition of a broker connection
//!
//! Configuration is read from YAML with environment overrides. When the configured broker lives on
//! the local machine and nobody is listening, an [`EmbeddedBroker`] is started in-process.

mod config;
mod connector;
mod embedded;

pub use config::{BrokerConnectionConfig, ConfigurationError, Credentials};
pub use connector::{BrokerConnectionError, BrokerConnector};
pub use embedded::{BrokerStartupError, BrokerState, EmbeddedBroker};
