//! Consuming side of evaluations
//!
//! A [`SubscriberClient`] listens for announced evaluations and writes those that request one
//! of its formats through a [`ConsumerFactory`]. Every evaluation is consumed by its own task
//! with its own consumers and output directory.

mod client;
mod consumer;
mod evaluation;
mod options;
mod registry;
mod writer;

pub use client::{ClientPhase, SubscriberClient, SubscriberError, SubscriberOptions, SubscriberStatus};
pub use consumer::{Artifacts, ConsumerError, ConsumerFactory, GroupConsumer, MessageConsumer};
pub use evaluation::{EvaluationError, EvaluationOutcome, FailurePolicy};
pub use options::Options;
pub use registry::{FormatRegistry, UnsupportedFormatError};
pub use writer::{BinaryWriterFactory, InvalidNameError, TabularWriterFactory};

use crate::harness::broker::BrokerConnector;
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Module implementation
pub struct Subscriber {
    options: Options,
    connector: Option<BrokerConnector>,
    client: Option<Arc<SubscriberClient<BrokerConnector>>>,
}

impl Subscriber {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            connector: None,
            client: None,
        }
    }
}

#[async_trait]
impl Module for Subscriber {
    async fn pre_startup(&mut self) -> EmptyResult {
        let config = self.options.broker.config()?;
        self.connector = Some(BrokerConnector::connect(config).await?);
        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let connector = self
            .connector
            .as_ref()
            .ok_or("broker connection has not been established")?;

        let factory = FormatRegistry::default().build(self.options.format)?;
        let client = Arc::new(SubscriberClient::new(
            connector,
            factory,
            self.options.subscriber_options(),
        )?);

        client.start().await?;
        self.client = Some(client.clone());

        let (heart, mut stone) = Heart::new();

        tokio::spawn(async move {
            if let Err(SubscriberError::Failed(e)) = client.terminated().await {
                stone.kill(format!("subscriber failed: {}", e)).await;
            }
        });

        Ok(Some(heart))
    }

    async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) -> bool {
        let mut success = matches!(
            termination_reason,
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally
        );

        if let Some(client) = self.client.take() {
            client.stop().await;

            if client.status() != SubscriberStatus::Succeeded {
                warn!(status = ?client.status(), "Subscriber did not finish cleanly");
                success = false;
            }
        }

        if let Some(connector) = self.connector.take() {
            connector.close();
        }

        if success {
            info!("Subscriber exited normally");
        } else {
            error!(reason = %termination_reason, "Subscriber terminated with an error");
        }

        success
    }
}
