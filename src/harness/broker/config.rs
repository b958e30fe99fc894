use crate::constants::broker::{
    ADDRESS_ENV, CONFIG_FILE_NAME, CONFIG_PATH_ENV, DEFAULT_HOST, DEFAULT_PORT, PORT_ENV,
};
use crate::constants::destinations::DEFAULT_ADDRESSES;
use crate::library::communication::NamingContext;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Broker configuration could not be assembled
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Configuration file exists but could not be read
    #[error("unable to read broker configuration from {path}")]
    Read {
        /// Location of the file
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// Configuration is not valid YAML or has the wrong shape
    #[error("malformed broker configuration in {origin}")]
    Parse {
        /// File or other source the configuration came from
        origin: String,
        /// Underlying cause
        #[source]
        source: serde_yaml::Error,
    },
    /// Environment override has an invalid value
    #[error("environment variable {variable} has invalid value '{value}'")]
    Environment {
        /// Name of the variable
        variable: &'static str,
        /// Offending value
        value: String,
    },
}

/// Credentials passed through to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Optional user name
    #[serde(default)]
    pub username: Option<String>,
    /// Password
    pub password: String,
}

/// Properties required to reach the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConnectionConfig {
    /// Host name or IP address of the broker
    pub host: String,
    /// Port of the broker, `0` on a loopback host picks a free port for an embedded broker
    pub port: u16,
    /// Optional credentials
    pub credentials: Option<Credentials>,
    /// Mapping of logical destination names to physical channel prefixes
    pub destinations: NamingContext,
    /// Number of retries when connecting to the broker
    pub connection_retries: u32,
    /// Whether an embedded broker may fall back to an ephemeral port
    pub dynamic_binding: bool,
}

impl Default for BrokerConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            credentials: None,
            destinations: DEFAULT_ADDRESSES.iter().copied().collect(),
            connection_retries: 5,
            dynamic_binding: true,
        }
    }
}

impl BrokerConnectionConfig {
    /// Loads the configuration from the usual locations and applies environment overrides
    ///
    /// The file named by `EVALBUS_BROKER_CONFIG` takes precedence over `./eventbroker.yaml`.
    /// Built-in defaults are used when neither exists.
    pub fn load() -> Result<Self, ConfigurationError> {
        let explicit = env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let local = PathBuf::from(CONFIG_FILE_NAME);

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if local.is_file() => Self::from_file(&local)?,
            None => {
                debug!("No broker configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_environment(|variable| env::var(variable).ok())?;

        Ok(config)
    }

    /// Reads the configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        info!(path = %path.display(), "Loading broker configuration");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&content, &path.display().to_string())
    }

    /// Parses the configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        Self::parse(content, "inline document")
    }

    fn parse(content: &str, origin: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(content).map_err(|source| ConfigurationError::Parse {
            origin: origin.to_owned(),
            source,
        })
    }

    /// Replaces host and port where values are given
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }

        if let Some(port) = port {
            self.port = port;
        }

        self
    }

    /// Applies the `BROKER_ADDRESS` and `BROKER_PORT` overrides obtained through the given lookup
    pub fn apply_environment<F>(&mut self, lookup: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ADDRESS_ENV).filter(|host| !host.trim().is_empty()) {
            self.host = host.trim().to_owned();
        }

        if let Some(port) = lookup(PORT_ENV) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigurationError::Environment {
                    variable: PORT_ENV,
                    value: port,
                })?;
        }

        Ok(())
    }

    /// Whether the host refers to the local machine
    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');

        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }

        host.parse::<IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false)
    }

    /// Printable `host:port` pair
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection parameters for the broker client
    pub fn connection_info(&self) -> ConnectionInfo {
        let (username, password) = match &self.credentials {
            Some(credentials) => (
                credentials.username.clone(),
                Some(credentials.password.clone()),
            ),
            None => (None, None),
        };

        ConnectionInfo {
            addr: ConnectionAddr::Tcp(
                self.host
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_owned(),
                self.port,
            ),
            redis: RedisConnectionInfo {
                db: 0,
                username,
                password,
            },
        }
    }
}
