use super::endpoint::{EndpointError, ExecutionEndpoint, Manifest};
use crate::domain::event::JobStatusNotification;
use crate::domain::{JobDescriptor, JobIdentifier, JobStatus};
use crate::library::communication::event::NotificationPublisher;
use crate::library::communication::{
    CommunicationFactory, Destination, DestinationNotFoundError, DestinationResolver,
};
use crate::library::helpers::{RetryError, RetryPolicy};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Submission was refused or the endpoint could not be reached
#[derive(Debug, Error)]
#[error("unable to submit job {job_id} to {endpoint} after {attempts} attempts")]
pub struct JobSubmissionError {
    /// Job which could not be submitted
    pub job_id: JobIdentifier,
    /// Location of the execution endpoint
    pub endpoint: String,
    /// Number of attempts made
    pub attempts: u32,
    /// Error of the last attempt
    #[source]
    pub source: EndpointError,
}

/// Status of a running job could not be obtained within the polling retry budget
#[derive(Debug, Error)]
#[error("unable to poll status of job {job_id} (evaluation {evaluation_id}) after {attempts} attempts")]
pub struct JobPollingTransientError {
    /// Job being polled
    pub job_id: JobIdentifier,
    /// Identifier assigned by the execution endpoint
    pub evaluation_id: String,
    /// Number of attempts made
    pub attempts: u32,
    /// Error of the last attempt
    #[source]
    pub source: EndpointError,
}

/// Reasons why a job did not produce an outcome
#[derive(Debug, Error)]
pub enum JobError {
    /// Job could not be submitted
    #[error(transparent)]
    Submission(#[from] JobSubmissionError),
    /// Job status could not be polled
    #[error(transparent)]
    Polling(#[from] JobPollingTransientError),
    /// Output manifest of a completed job could not be fetched
    #[error("unable to fetch output manifest of job {job_id} (evaluation {evaluation_id})")]
    Manifest {
        /// Job which completed
        job_id: JobIdentifier,
        /// Identifier assigned by the execution endpoint
        evaluation_id: String,
        /// Error of the final attempt
        #[source]
        source: RetryError<EndpointError>,
    },
    /// Job was cancelled through its handle
    #[error("job {job_id} was cancelled")]
    Cancelled {
        /// Job which was cancelled
        job_id: JobIdentifier,
    },
    /// Task driving the job ended abnormally
    #[error("job {job_id} was interrupted")]
    Interrupted {
        /// Job which was interrupted
        job_id: JobIdentifier,
        /// Underlying error
        #[source]
        source: JoinError,
    },
}

/// Result of a job which reached a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job the outcome belongs to
    pub job_id: JobIdentifier,
    /// Terminal status
    pub status: JobStatus,
    /// Identifier assigned by the execution endpoint
    pub evaluation_id: String,
    /// Standard output of the evaluation
    pub stdout: String,
    /// Standard error of the evaluation
    pub stderr: String,
    /// Output paths listed in the manifest
    pub outputs: Vec<PathBuf>,
    /// HTTP status of the manifest fetch, absent when no manifest was requested
    pub result_code: Option<u16>,
}

/// Tunables of the job orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOptions {
    /// Delay between two status polls
    pub poll_interval: Duration,
    /// Wall-clock duration after which a job is considered timed out
    pub max_duration: Duration,
    /// Retries of the submission on connection failures
    pub submit_policy: RetryPolicy,
    /// Retries of a single status poll on connection failures
    pub poll_policy: RetryPolicy,
    /// Retries of every fetch of outputs and logs on connection failures
    pub fetch_policy: RetryPolicy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_duration: Duration::from_secs(12 * 60 * 60),
            submit_policy: RetryPolicy::new(5, Duration::from_secs(1)),
            poll_policy: RetryPolicy::new(5, Duration::from_secs(1)),
            fetch_policy: RetryPolicy::new(6, Duration::from_millis(500)),
        }
    }
}

/// Maps a status reported by the execution endpoint, ignoring case
pub fn parse_server_status(raw: &str) -> JobStatus {
    match raw.trim().to_lowercase().as_str() {
        "completed" => JobStatus::Completed,
        "failed" | "closed" => JobStatus::Failed,
        "awaiting" | "opened" | "ongoing" | "in-progress" | "in_progress" | "running" => {
            JobStatus::InProgress
        }
        other => {
            warn!(status = other, "Unknown server status, assuming the job is in progress");
            JobStatus::InProgress
        }
    }
}

/// Submits jobs to an execution endpoint and follows them until they terminate
pub struct JobOrchestrator<F: CommunicationFactory, E> {
    publisher: F::NotificationPublisher,
    statuses: Destination,
    endpoint: Arc<E>,
    options: OrchestratorOptions,
}

impl<F, E> JobOrchestrator<F, E>
where
    F: CommunicationFactory,
    E: ExecutionEndpoint + 'static,
{
    /// Resolves the status destination and takes ownership of the endpoint
    pub fn new(
        communication: &F,
        endpoint: E,
        options: OrchestratorOptions,
    ) -> Result<Self, DestinationNotFoundError> {
        Ok(Self {
            publisher: communication.notification_publisher(),
            statuses: communication.route::<JobStatusNotification>(&[])?,
            endpoint: Arc::new(endpoint),
            options,
        })
    }

    /// Starts following the job in the background
    pub fn submit(&self, job: JobDescriptor) -> JobHandle {
        let (status_tx, status_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = job.job_id.clone();

        let execution = JobExecution {
            statuses: self.statuses.extend(&job_id),
            publisher: self.publisher.clone(),
            endpoint: self.endpoint.clone(),
            options: self.options.clone(),
            status: status_tx,
            cancel: cancel_rx,
            current: None,
            sequence: 0,
            job,
        };

        JobHandle {
            job_id,
            status: status_rx,
            canceller: JobCanceller {
                signal: Arc::new(cancel_tx),
            },
            task: tokio::spawn(execution.run()),
        }
    }
}

/// Cancels a job from anywhere, cloned from its [`JobHandle`]
#[derive(Clone)]
pub struct JobCanceller {
    signal: Arc<watch::Sender<bool>>,
}

impl JobCanceller {
    /// Stops polling, closes the evaluation on the endpoint and resolves the job as cancelled
    pub fn cancel(&self) {
        self.signal.send(true).ok();
    }
}

/// Running job
pub struct JobHandle {
    job_id: JobIdentifier,
    status: watch::Receiver<Option<JobStatus>>,
    canceller: JobCanceller,
    task: JoinHandle<Result<JobOutcome, JobError>>,
}

impl JobHandle {
    /// Identifier under which status transitions are published
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Latest status observed, absent until the endpoint accepted the job
    pub fn status(&self) -> Option<JobStatus> {
        *self.status.borrow()
    }

    /// Requests cooperative cancellation
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Handle that may cancel the job after this one has been consumed
    pub fn canceller(&self) -> JobCanceller {
        self.canceller.clone()
    }

    /// Waits for the job to terminate
    pub async fn result(self) -> Result<JobOutcome, JobError> {
        match self.task.await {
            Ok(result) => result,
            Err(source) => Err(JobError::Interrupted {
                job_id: self.job_id,
                source,
            }),
        }
    }
}

/// State of one job while it is followed
struct JobExecution<P, E> {
    job: JobDescriptor,
    statuses: Destination,
    publisher: P,
    endpoint: Arc<E>,
    options: OrchestratorOptions,
    status: watch::Sender<Option<JobStatus>>,
    cancel: watch::Receiver<bool>,
    current: Option<JobStatus>,
    sequence: u64,
}

/// Why following a job stopped early
enum Interruption<E> {
    Cancelled,
    Failed(E),
}

impl<P, E> JobExecution<P, E>
where
    P: NotificationPublisher + Send + Sync,
    E: ExecutionEndpoint,
{
    #[instrument(skip(self), fields(job_id = %self.job.job_id, endpoint = self.endpoint.location()))]
    async fn run(mut self) -> Result<JobOutcome, JobError> {
        let evaluation_id = match self.submit().await {
            Ok(evaluation_id) => evaluation_id,
            Err(error) => {
                self.conclude(None, &error).await;
                return Err(error);
            }
        };

        info!(%evaluation_id, "Job accepted");
        self.transition(JobStatus::Submitted, Some(&evaluation_id), None)
            .await;

        let result = self.follow(&evaluation_id).await;

        if let Err(error) = &result {
            self.conclude(Some(&evaluation_id), error).await;
        }

        // Exactly one close per accepted job, whatever the outcome
        if let Err(e) = self.endpoint.close(&evaluation_id).await {
            warn!(%evaluation_id, error = %e, "Unable to close evaluation");
        }

        result
    }

    /// Publishes a failure for a job that ended with an error, unless it already terminated
    async fn conclude(&mut self, evaluation_id: Option<&str>, error: &JobError) {
        if self.current.map_or(false, |status| status.is_terminal()) {
            return;
        }

        self.transition(JobStatus::Failed, evaluation_id, Some(error.to_string()))
            .await;
    }

    async fn submit(&mut self) -> Result<String, JobError> {
        let endpoint = self.endpoint.clone();
        let declaration = self.job.declaration.clone();
        let policy = self.options.submit_policy.clone();
        let attempt = policy.execute(
            || endpoint.submit(&declaration),
            EndpointError::is_transient,
        );

        match self.interruptible(attempt).await {
            Ok(evaluation_id) => Ok(evaluation_id),
            Err(Interruption::Cancelled) => Err(self.cancelled()),
            Err(Interruption::Failed(error)) => Err(JobSubmissionError {
                job_id: self.job.job_id.clone(),
                endpoint: self.endpoint.location().to_owned(),
                attempts: error.attempts(),
                source: error.into_inner(),
            }
            .into()),
        }
    }

    async fn follow(&mut self, evaluation_id: &str) -> Result<JobOutcome, JobError> {
        let deadline = Instant::now() + self.options.max_duration;
        let mut status = self.poll_until_terminal(evaluation_id, deadline).await?;

        match status {
            JobStatus::Failed => {
                self.transition(status, Some(evaluation_id), None).await;
            }
            JobStatus::TimedOut => {
                let detail = format!("no terminal status within {:?}", self.options.max_duration);
                self.transition(status, Some(evaluation_id), Some(detail))
                    .await;
            }
            _ => {}
        }

        let (stdout, stderr) = self.fetch_logs(evaluation_id).await?;

        let mut outputs = Vec::new();
        let mut result_code = None;

        if status == JobStatus::Completed {
            let manifest = self.fetch_manifest(evaluation_id).await?;
            result_code = Some(manifest.status);

            if manifest.is_success() {
                outputs = manifest.paths;
                self.transition(status, Some(evaluation_id), None).await;
            } else {
                status = JobStatus::Failed;
                let detail = format!("output manifest unavailable (status {})", manifest.status);
                self.transition(status, Some(evaluation_id), Some(detail))
                    .await;
            }
        }

        info!(%status, outputs = outputs.len(), "Job terminated");

        Ok(JobOutcome {
            job_id: self.job.job_id.clone(),
            status,
            evaluation_id: evaluation_id.to_owned(),
            stdout,
            stderr,
            outputs,
            result_code,
        })
    }

    /// Polls until the endpoint reports a terminal status or the deadline passes
    ///
    /// Completion is not published here as the manifest decides the final outcome.
    async fn poll_until_terminal(
        &mut self,
        evaluation_id: &str,
        deadline: Instant,
    ) -> Result<JobStatus, JobError> {
        loop {
            let endpoint = self.endpoint.clone();
            let policy = self.options.poll_policy.clone();
            let poll = timeout_at(
                deadline,
                policy.execute(|| endpoint.status(evaluation_id), EndpointError::is_transient),
            );

            let raw = match self.interruptible(poll).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(error)) => {
                    return Err(JobPollingTransientError {
                        job_id: self.job.job_id.clone(),
                        evaluation_id: evaluation_id.to_owned(),
                        attempts: error.attempts(),
                        source: error.into_inner(),
                    }
                    .into())
                }
                Err(Interruption::Cancelled) => return Err(self.cancelled()),
                Err(Interruption::Failed(_elapsed)) => return Ok(JobStatus::TimedOut),
            };

            let status = parse_server_status(&raw);
            debug!(%raw, %status, "Polled job status");

            match status {
                JobStatus::Completed | JobStatus::Failed => return Ok(status),
                _ => self.transition(status, Some(evaluation_id), None).await,
            }

            if Instant::now() >= deadline {
                return Ok(JobStatus::TimedOut);
            }

            let pause = sleep(
                self.options
                    .poll_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
            );
            if let Err(Interruption::Cancelled) = self.interruptible(async {
                pause.await;
                Ok::<(), ()>(())
            })
            .await
            {
                return Err(self.cancelled());
            }
        }
    }

    /// Fetches both logs, a log which cannot be fetched is left empty
    async fn fetch_logs(&self, evaluation_id: &str) -> Result<(String, String), JobError> {
        let endpoint = &self.endpoint;
        let policy = &self.options.fetch_policy;

        let stdout = self
            .interruptible(
                policy.execute(|| endpoint.stdout(evaluation_id), EndpointError::is_transient),
            )
            .await;
        let stdout = self.log_or_empty(stdout, evaluation_id, "stdout")?;

        let stderr = self
            .interruptible(
                policy.execute(|| endpoint.stderr(evaluation_id), EndpointError::is_transient),
            )
            .await;
        let stderr = self.log_or_empty(stderr, evaluation_id, "stderr")?;

        Ok((stdout, stderr))
    }

    fn log_or_empty(
        &self,
        result: Result<String, Interruption<RetryError<EndpointError>>>,
        evaluation_id: &str,
        stream: &'static str,
    ) -> Result<String, JobError> {
        match result {
            Ok(log) => Ok(log),
            Err(Interruption::Cancelled) => Err(self.cancelled()),
            Err(Interruption::Failed(e)) => {
                warn!(%evaluation_id, stream, error = %e, "Unable to fetch evaluation log");
                Ok(String::new())
            }
        }
    }

    async fn fetch_manifest(&self, evaluation_id: &str) -> Result<Manifest, JobError> {
        let endpoint = &self.endpoint;
        let fetch = self.options.fetch_policy.execute(
            || endpoint.manifest(evaluation_id),
            EndpointError::is_transient,
        );

        match self.interruptible(fetch).await {
            Ok(manifest) => Ok(manifest),
            Err(Interruption::Cancelled) => Err(self.cancelled()),
            Err(Interruption::Failed(source)) => Err(JobError::Manifest {
                job_id: self.job.job_id.clone(),
                evaluation_id: evaluation_id.to_owned(),
                source,
            }),
        }
    }

    /// Runs the operation unless the job is cancelled first
    async fn interruptible<T, X, Fut>(&self, operation: Fut) -> Result<T, Interruption<X>>
    where
        Fut: Future<Output = Result<T, X>>,
    {
        let mut cancel = self.cancel.clone();

        tokio::select! {
            result = operation => result.map_err(Interruption::Failed),
            _ = cancellation_requested(&mut cancel) => Err(Interruption::Cancelled),
        }
    }

    fn cancelled(&self) -> JobError {
        warn!("Job cancelled");
        JobError::Cancelled {
            job_id: self.job.job_id.clone(),
        }
    }

    /// Records and publishes a status unless it equals the previous one
    async fn transition(
        &mut self,
        status: JobStatus,
        evaluation_id: Option<&str>,
        detail: Option<String>,
    ) {
        if self.current == Some(status) {
            return;
        }

        self.current = Some(status);
        self.sequence += 1;
        self.status.send(Some(status)).ok();

        let notification = JobStatusNotification {
            job_id: self.job.job_id.clone(),
            sequence: self.sequence,
            status,
            evaluation_id: evaluation_id.map(str::to_owned),
            detail,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.publisher.publish(&notification, &self.statuses).await {
            warn!(destination = %self.statuses, error = %e, "Unable to publish job status");
        }
    }
}

/// Resolves once cancellation has been requested, never if the handle is gone without cancelling
async fn cancellation_requested(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow() {
            return;
        }

        if signal.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
