//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use crate::harness::broker::{BrokerConnectionConfig, ConfigurationError};
use structopt::StructOpt;

/// Options for reaching the message broker
///
/// Values given here take precedence over the configuration file and its environment overrides.
#[derive(Debug, Default, StructOpt)]
pub struct BrokerOptions {
    /// Broker host name or IP address
    #[structopt(long = "broker-host", global = true, value_name = "host")]
    pub host: Option<String>,

    /// Broker port, zero picks a free port for an embedded broker
    #[structopt(long = "broker-port", global = true, value_name = "port")]
    pub port: Option<u16>,
}

impl BrokerOptions {
    /// Loads the broker configuration and applies these options on top
    pub fn config(&self) -> Result<BrokerConnectionConfig, ConfigurationError> {
        Ok(BrokerConnectionConfig::load()?.with_overrides(self.host.clone(), self.port))
    }
}
