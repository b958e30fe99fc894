//! Submission of evaluation jobs to a remote execution endpoint
//!
//! A [`JobOrchestrator`] submits a [`JobDescriptor`](crate::domain::JobDescriptor), polls the
//! endpoint until the job terminates and publishes every status transition on the job status
//! destination. The evaluation is closed on the endpoint exactly once, whatever the outcome.

mod endpoint;
mod job;
mod options;

pub use endpoint::{EndpointError, ExecutionEndpoint, HttpExecutionEndpoint, Manifest};
pub use job::{
    parse_server_status, JobCanceller, JobError, JobHandle, JobOrchestrator, JobOutcome,
    JobPollingTransientError, JobSubmissionError, OrchestratorOptions,
};
pub use options::Options;

use crate::domain::{JobDescriptor, JobStatus};
use crate::harness::broker::BrokerConnector;
use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Module implementation submitting a single job and waiting for its outcome
pub struct Submitter {
    options: Options,
    declaration: Option<String>,
    connector: Option<BrokerConnector>,
    canceller: Option<JobCanceller>,
    waiter: Option<JoinHandle<Result<JobOutcome, JobError>>>,
}

impl Submitter {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            declaration: None,
            connector: None,
            canceller: None,
            waiter: None,
        }
    }

    fn descriptor(&self, declaration: String) -> JobDescriptor {
        let descriptor = JobDescriptor::new(declaration).with_resources(self.options.resources());

        match &self.options.job_id {
            Some(job_id) => descriptor.with_job_id(job_id.clone()),
            None => descriptor,
        }
    }
}

#[async_trait]
impl Module for Submitter {
    async fn pre_startup(&mut self) -> EmptyResult {
        let path = &self.options.declaration;
        let declaration = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("unable to read declaration {}: {}", path.display(), e))?;
        self.declaration = Some(declaration);

        let config = self.options.broker.config()?;
        self.connector = Some(BrokerConnector::connect(config).await?);

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let declaration = self
            .declaration
            .take()
            .ok_or("declaration has not been read")?;
        let connector = self
            .connector
            .as_ref()
            .ok_or("broker connection has not been established")?;

        let endpoint = HttpExecutionEndpoint::new(self.options.endpoint.clone());
        let orchestrator =
            JobOrchestrator::new(connector, endpoint, self.options.orchestrator_options())?;

        let handle = orchestrator.submit(self.descriptor(declaration));
        info!(job_id = handle.job_id(), endpoint = %self.options.endpoint, "Job submitted");
        self.canceller = Some(handle.canceller());

        let (heart, mut stone) = Heart::new();

        self.waiter = Some(tokio::spawn(async move {
            let result = handle.result().await;
            stone.kill("job terminated".to_owned()).await;
            result
        }));

        Ok(Some(heart))
    }

    async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) -> bool {
        if let Some(canceller) = self.canceller.take() {
            canceller.cancel();
        }

        let result = match self.waiter.take() {
            Some(waiter) => waiter.await.ok(),
            None => None,
        };

        if let Some(connector) = self.connector.take() {
            connector.close();
        }

        match result {
            Some(Ok(outcome)) => {
                match serde_json::to_string_pretty(&outcome) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!(error = %e, "Unable to serialize job outcome"),
                }

                info!(status = %outcome.status, "Job finished");
                outcome.status == JobStatus::Completed
            }
            Some(Err(e)) => {
                error!(error = %e, "Job did not finish");
                false
            }
            None => {
                error!(reason = %termination_reason, "Submitter terminated before the job finished");
                false
            }
        }
    }
}
