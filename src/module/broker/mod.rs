//! Standalone embedded broker
//!
//! Runs the in-process broker on its own so that publishers and subscribers on other
//! hosts can reach a shared instance without an external Redis server.

use crate::harness::broker::EmbeddedBroker;
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::BoxedError;
use async_trait::async_trait;
use std::net::SocketAddr;
use structopt::StructOpt;
use tracing::info;

/// Options for the broker module
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Address the broker accepts clients on
    #[structopt(short, long, env = "BROKER_LISTEN", default_value = "127.0.0.1:6379")]
    pub listen: SocketAddr,

    /// Fail instead of falling back to an ephemeral port when the address is taken
    #[structopt(long)]
    pub fixed_port: bool,
}

/// Module implementation
pub struct Broker {
    broker: EmbeddedBroker,
}

impl Broker {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            broker: EmbeddedBroker::new(options.listen, !options.fixed_port),
        }
    }
}

#[async_trait]
impl Module for Broker {
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let address = self.broker.start().await?;
        info!(%address, "Accepting broker clients");

        Ok(Some(Heart::without_heart_stone()))
    }

    async fn post_shutdown(&mut self, _termination_reason: ModuleTerminationReason) -> bool {
        self.broker.stop();
        true
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::harness::broker::BrokerState;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn stop_the_broker_on_shutdown() {
        let mut module = Broker::new(Options {
            listen: ([127, 0, 0, 1], 0).into(),
            fixed_port: true,
        });

        assert!(module.run().await.unwrap().is_some());
        assert_eq!(module.broker.state(), BrokerState::Running);

        assert!(module.post_shutdown(ModuleTerminationReason::ExitedNormally).await);
        assert_eq!(module.broker.state(), BrokerState::Stopped);
    }
}
