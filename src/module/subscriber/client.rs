use super::evaluation::{EvaluationError, EvaluationOutcome, EvaluationRun, FailurePolicy};
use super::ConsumerFactory;
use crate::constants::destinations::{ACKNOWLEDGEMENTS, STATISTICS};
use crate::domain::event::{EvaluationAnnouncedNotification, EvaluationFrame, SubscriberNotification};
use crate::domain::{ConsumerDescription, EvaluationDescriptor, EvaluationIdentifier};
use crate::library::communication::event::{
    NotificationPublisher, Subscription, SubscriptionProvider,
};
use crate::library::communication::{
    BlackboxError, CommunicationFactory, Destination, DestinationNotFoundError,
    DestinationResolver,
};
use crate::library::BoxedError;
use futures::StreamExt;
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Tunables of a subscriber client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Directory below which every evaluation gets its own output directory
    pub output_root: PathBuf,
    /// Number of consecutive recoverable failures tolerated within one evaluation
    pub max_consecutive_skips: usize,
    /// Time without frames after which an evaluation is abandoned, zero waits forever
    pub evaluation_idle_timeout: Duration,
    /// Interval at which the publisher is told that an evaluation is still being consumed, zero disables heartbeats
    pub heartbeat_interval: Duration,
    /// Number of evaluation ids remembered to ignore repeated announcements
    pub handled_cache_size: usize,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            output_root: std::env::temp_dir().join("evalbus"),
            max_consecutive_skips: 5,
            evaluation_idle_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            handled_cache_size: 1024,
        }
    }
}

/// Lifecycle phase of a [`SubscriberClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Constructed but not started
    Created,
    /// Subscribing to announcements
    Starting,
    /// Consuming announced evaluations
    Running,
    /// Failed irrecoverably, waiting to be stopped
    Failed,
    /// Stopped, see [`SubscriberClient::status`] for the outcome
    Stopped,
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientPhase::Created => "created",
            ClientPhase::Starting => "starting",
            ClientPhase::Running => "running",
            ClientPhase::Failed => "failed",
            ClientPhase::Stopped => "stopped",
        };

        f.write_str(name)
    }
}

/// Outcome of a subscriber client as observed so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberStatus {
    /// No terminal state has been reached
    Running,
    /// Stopped without failures
    Succeeded,
    /// Failed, or stopped while evaluations were in flight
    Failed,
}

/// Errors surfaced by a [`SubscriberClient`]
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// A logical destination has no address
    #[error("subscriber destinations are incomplete")]
    Destination(#[from] DestinationNotFoundError),
    /// Broker interaction failed
    #[error("unable to communicate on {destination}")]
    Communication {
        /// Destination involved
        destination: Destination,
        /// Underlying error
        #[source]
        source: BoxedError,
    },
    /// Operation is not allowed in the current phase
    #[error("operation not allowed while the subscriber is {0}")]
    InvalidState(ClientPhase),
    /// Consumption of an evaluation failed
    #[error("evaluation {evaluation_id} failed")]
    Evaluation {
        /// Evaluation which failed
        evaluation_id: EvaluationIdentifier,
        /// Underlying error
        #[source]
        source: EvaluationError,
    },
    /// Client failed irrecoverably
    #[error("subscriber failed")]
    Failed(#[source] BlackboxError),
    /// Client was stopped while evaluations were in flight
    #[error("subscriber was stopped while {in_flight} evaluations were in flight")]
    Cancelled {
        /// Number of evaluations abandoned
        in_flight: usize,
    },
    /// No terminal state was reached in time
    #[error("subscriber did not reach a terminal state within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeeded,
    Failed(BlackboxError),
    Cancelled(usize),
}

struct ClientState {
    phase: ClientPhase,
    outcome: Option<Outcome>,
    dispatcher: Option<JoinHandle<()>>,
    evaluations: HashMap<EvaluationIdentifier, JoinHandle<()>>,
    handled: LruCache<EvaluationIdentifier, ()>,
}

struct Shared<P, S> {
    publisher: P,
    provider: S,
    statistics: Destination,
    acknowledgements: Destination,
    factory: Arc<dyn ConsumerFactory>,
    consumer: ConsumerDescription,
    options: SubscriberOptions,
    state: Mutex<ClientState>,
    changes: watch::Sender<()>,
}

/// Long-running consumer of every evaluation requesting one of its formats
///
/// Each announced evaluation gets fresh consumers from the [`ConsumerFactory`], its own output
/// directory and its own task. The client fails as soon as one evaluation fails irrecoverably.
pub struct SubscriberClient<F: CommunicationFactory> {
    shared: Arc<Shared<F::NotificationPublisher, F::SubscriptionProvider>>,
    announcements: Destination,
    changes: watch::Receiver<()>,
}

impl<F: CommunicationFactory> SubscriberClient<F> {
    /// Resolves all destinations and describes the consumer
    pub fn new(
        communication: &F,
        factory: Arc<dyn ConsumerFactory>,
        options: SubscriberOptions,
    ) -> Result<Self, SubscriberError> {
        let (changes_tx, changes_rx) = watch::channel(());
        let consumer = factory.describe();

        let state = ClientState {
            phase: ClientPhase::Created,
            outcome: None,
            dispatcher: None,
            evaluations: HashMap::new(),
            handled: LruCache::new(options.handled_cache_size.max(1)),
        };

        let shared = Shared {
            publisher: communication.notification_publisher(),
            provider: communication.subscription_provider(),
            statistics: communication.lookup(STATISTICS)?,
            acknowledgements: communication.lookup(ACKNOWLEDGEMENTS)?,
            factory,
            consumer,
            options,
            state: Mutex::new(state),
            changes: changes_tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            announcements: communication.route::<EvaluationAnnouncedNotification>(&[])?,
            changes: changes_rx,
        })
    }

    /// Identity and formats announced to publishers
    pub fn consumer(&self) -> &ConsumerDescription {
        &self.shared.consumer
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ClientPhase {
        self.shared.state().phase
    }

    /// Outcome as observed so far
    pub fn status(&self) -> SubscriberStatus {
        match self.shared.state().outcome {
            None => SubscriberStatus::Running,
            Some(Outcome::Succeeded) => SubscriberStatus::Succeeded,
            Some(Outcome::Failed(_)) | Some(Outcome::Cancelled(_)) => SubscriberStatus::Failed,
        }
    }

    /// Number of evaluations currently being consumed
    pub fn in_flight(&self) -> usize {
        self.shared.state().evaluations.len()
    }

    /// Subscribes to announcements and starts consuming evaluations
    #[instrument(skip(self), fields(consumer_id = %self.shared.consumer.consumer_id))]
    pub async fn start(&self) -> Result<(), SubscriberError> {
        {
            let mut state = self.shared.state();
            if state.phase != ClientPhase::Created {
                return Err(SubscriberError::InvalidState(state.phase));
            }
            state.phase = ClientPhase::Starting;
        }

        let subscription = match self
            .shared
            .provider
            .subscribe::<EvaluationAnnouncedNotification>(&self.announcements)
            .await
        {
            Ok(subscription) => subscription,
            Err(source) => {
                let error = SubscriberError::Communication {
                    destination: self.announcements.clone(),
                    source,
                };
                self.shared
                    .fail(BlackboxError::from(&error as &(dyn std::error::Error + 'static)));
                return Err(error);
            }
        };

        {
            let mut state = self.shared.state();

            // Stopped while subscribing
            if state.phase != ClientPhase::Starting {
                return Err(SubscriberError::InvalidState(state.phase));
            }

            state.dispatcher = Some(tokio::spawn(self.shared.clone().dispatch(subscription)));
            state.phase = ClientPhase::Running;
        }

        self.shared.notify();
        info!(formats = ?self.shared.consumer.formats, "Subscriber running");

        Ok(())
    }

    /// Waits until the client failed or has been stopped
    pub async fn terminated(&self) -> Result<(), SubscriberError> {
        let mut changes = self.changes.clone();

        loop {
            let outcome = self.shared.state().outcome.clone();

            match outcome {
                Some(Outcome::Succeeded) => return Ok(()),
                Some(Outcome::Failed(error)) => return Err(SubscriberError::Failed(error)),
                Some(Outcome::Cancelled(in_flight)) => {
                    return Err(SubscriberError::Cancelled { in_flight })
                }
                None => {}
            }

            if changes.changed().await.is_err() {
                return Err(SubscriberError::Cancelled { in_flight: 0 });
            }
        }
    }

    /// Like [`terminated`](Self::terminated) but gives up after the given time
    pub async fn await_terminal(&self, limit: Duration) -> Result<(), SubscriberError> {
        match timeout(limit, self.terminated()).await {
            Ok(result) => result,
            Err(_) => Err(SubscriberError::Timeout(limit)),
        }
    }

    /// Unsubscribes, abandons evaluations in flight and closes the consumer factory
    ///
    /// Safe to call repeatedly and in any phase. Publishers of abandoned evaluations are told that this subscriber failed.
    #[instrument(skip(self), fields(consumer_id = %self.shared.consumer.consumer_id))]
    pub async fn stop(&self) {
        let (dispatcher, evaluations) = {
            let mut state = self.shared.state();

            if state.phase == ClientPhase::Stopped {
                return;
            }

            state.phase = ClientPhase::Stopped;
            (
                state.dispatcher.take(),
                std::mem::take(&mut state.evaluations),
            )
        };

        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        let in_flight = evaluations.len();
        for (evaluation_id, task) in evaluations {
            task.abort();
            warn!(%evaluation_id, "Abandoning evaluation in flight");
            self.shared
                .report_failure(&evaluation_id, BlackboxError::from_message("subscriber stopped"))
                .await;
        }

        let factory = self.shared.factory.clone();
        match tokio::task::spawn_blocking(move || factory.close()).await {
            Ok(Ok(())) => debug!("Consumer factory closed"),
            Ok(Err(e)) => error!(error = %e, "Failed to close consumer factory"),
            Err(e) => error!(error = %e, "Consumer factory panicked while closing"),
        }

        {
            let mut state = self.shared.state();
            if state.outcome.is_none() {
                state.outcome = Some(if in_flight > 0 {
                    Outcome::Cancelled(in_flight)
                } else {
                    Outcome::Succeeded
                });
            }
        }

        self.shared.notify();
        info!(in_flight, status = ?self.status(), "Subscriber stopped");
    }
}

impl<P, S> Shared<P, S>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
    S: SubscriptionProvider + Clone + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send(()).ok();
    }

    fn fail(&self, error: BlackboxError) {
        {
            let mut state = self.state();

            if state.outcome.is_some() {
                return;
            }

            if state.phase != ClientPhase::Stopped {
                state.phase = ClientPhase::Failed;
            }
            state.outcome = Some(Outcome::Failed(error));
        }

        self.notify();
    }

    async fn dispatch(self: Arc<Self>, mut subscription: Subscription<EvaluationAnnouncedNotification>) {
        while let Some(item) = subscription.next().await {
            match item {
                Ok(announcement) => self.accept(announcement.descriptor),
                Err(e) => warn!(error = %e, "Discarding malformed announcement"),
            }
        }

        error!("Announcement subscription ended");
        self.fail(BlackboxError::from_message(
            "announcement subscription ended unexpectedly",
        ));
    }

    fn accept(self: &Arc<Self>, descriptor: EvaluationDescriptor) {
        let evaluation_id = descriptor.id.clone();

        if !descriptor.accepts(&self.consumer.formats) {
            debug!(%evaluation_id, "Ignoring evaluation without supported formats");
            return;
        }

        let mut state = self.state();

        if state.phase != ClientPhase::Running || state.handled.contains(&evaluation_id) {
            return;
        }
        state.handled.put(evaluation_id.clone(), ());

        info!(%evaluation_id, "Consuming announced evaluation");
        let task = tokio::spawn(self.clone().evaluate(Arc::new(descriptor)));
        state.evaluations.insert(evaluation_id, task);
    }

    async fn evaluate(self: Arc<Self>, descriptor: Arc<EvaluationDescriptor>) {
        let evaluation_id = descriptor.id.clone();
        let result = self.consume(descriptor).await;

        self.state().evaluations.remove(&evaluation_id);

        match result {
            Ok(EvaluationOutcome::Consumed) => info!(%evaluation_id, "Evaluation consumed"),
            Ok(EvaluationOutcome::Stopped(reason)) => {
                warn!(%evaluation_id, %reason, "Evaluation stopped by publisher")
            }
            Ok(EvaluationOutcome::Abandoned(reason)) => {
                warn!(%evaluation_id, %reason, "Evaluation abandoned");
                let error = BlackboxError::from_message(format!("evaluation abandoned: {}", reason));
                self.report_failure(&evaluation_id, error).await;
            }
            Err(source) => {
                let error = SubscriberError::Evaluation {
                    evaluation_id: evaluation_id.clone(),
                    source,
                };
                let error = BlackboxError::new(error);

                error!(%evaluation_id, %error, "Evaluation failed");
                self.report_failure(&evaluation_id, error.clone()).await;
                self.fail(error);
            }
        }
    }

    /// Registers with the publisher and consumes the evaluation's frames
    async fn consume(
        &self,
        descriptor: Arc<EvaluationDescriptor>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let output_dir = match output_directory(&self.options.output_root, &descriptor.id) {
            Some(directory) => directory,
            None => {
                let reason = format!("evaluation id '{}' is not usable as a directory name", descriptor.id);
                return Ok(EvaluationOutcome::Abandoned(reason));
            }
        };

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| EvaluationError::OutputDirectory {
                path: output_dir.clone(),
                source,
            })?;

        let message_consumer = self
            .factory
            .build_message_consumer(&descriptor, &output_dir)
            .map_err(EvaluationError::Setup)?;
        let group_consumer = self
            .factory
            .build_group_consumer(&descriptor, &output_dir)
            .map_err(EvaluationError::Setup)?;

        let consumer_id = self.consumer.consumer_id.clone();
        let frames_destination = self
            .statistics
            .extend(&descriptor.id)
            .extend(&consumer_id);
        let acknowledgements = self.acknowledgements.extend(&descriptor.id);

        let frames = self
            .provider
            .subscribe::<EvaluationFrame>(&frames_destination)
            .await
            .map_err(|source| EvaluationError::Communication {
                destination: frames_destination.clone(),
                source,
            })?;

        let ready = SubscriberNotification::Ready {
            consumer: self.consumer.clone(),
        };
        self.publisher
            .publish(&ready, &acknowledgements)
            .await
            .map_err(|source| EvaluationError::Communication {
                destination: acknowledgements.clone(),
                source,
            })?;

        debug!(evaluation_id = %descriptor.id, output_dir = %output_dir.display(), "Registered with publisher");

        EvaluationRun::new(
            descriptor,
            consumer_id,
            self.publisher.clone(),
            acknowledgements,
            message_consumer,
            group_consumer,
            FailurePolicy::new(self.options.max_consecutive_skips),
            self.options.evaluation_idle_timeout,
            self.options.heartbeat_interval,
        )
        .run(frames)
        .await
    }

    async fn report_failure(&self, evaluation_id: &str, error: BlackboxError) {
        let destination = self.acknowledgements.extend(evaluation_id);
        let notification = SubscriberNotification::Failed {
            consumer_id: self.consumer.consumer_id.clone(),
            error,
        };

        if let Err(e) = self.publisher.publish(&notification, &destination).await {
            warn!(%evaluation_id, error = %e, "Unable to report failure to publisher");
        }
    }
}

/// Output directory of an evaluation, if its id is a plain directory name
fn output_directory(root: &Path, evaluation_id: &str) -> Option<PathBuf> {
    let mut components = Path::new(evaluation_id).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(root.join(evaluation_id)),
        _ => None,
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::{Format, MeasurementMetadata, Statistic};
    use crate::library::communication::implementation::mock::{MockBroker, MockCommunicationFactory};
    use crate::module::publisher::{
        EvaluationPublisher, EvaluationSession, PublisherError, PublisherOptions,
    };
    use crate::module::subscriber::{BinaryWriterFactory, TabularWriterFactory};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    type Client = SubscriberClient<MockCommunicationFactory>;

    fn options(directory: &TempDir, max_consecutive_skips: usize) -> SubscriberOptions {
        SubscriberOptions {
            output_root: directory.path().to_owned(),
            max_consecutive_skips,
            ..Default::default()
        }
    }

    async fn client(
        communication: &MockCommunicationFactory,
        factory: Arc<dyn ConsumerFactory>,
        options: SubscriberOptions,
    ) -> Client {
        let client = SubscriberClient::new(communication, factory, options).unwrap();
        client.start().await.unwrap();
        client
    }

    async fn open(
        communication: &MockCommunicationFactory,
        formats: &[Format],
    ) -> EvaluationSession<MockBroker> {
        open_with(communication, formats, Default::default()).await
    }

    async fn open_with(
        communication: &MockCommunicationFactory,
        formats: &[Format],
        options: PublisherOptions,
    ) -> EvaluationSession<MockBroker> {
        let descriptor = EvaluationDescriptor::new(
            formats.iter().copied(),
            MeasurementMetadata {
                variable: "streamflow".into(),
                unit: "CMS".into(),
                labels: Default::default(),
            },
        );

        EvaluationPublisher::new(communication, options)
            .unwrap()
            .open(descriptor)
            .await
            .unwrap()
    }

    fn mean_error(value: f64) -> Vec<Statistic> {
        vec![Statistic::new("MEAN_ERROR", "0-6h", value)]
    }

    fn unusable() -> Vec<Statistic> {
        vec![Statistic::new("", "0-6h", 1.0)]
    }

    async fn wait_until<C: Fn() -> bool>(condition: C) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn write_every_requested_format() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();

        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 5)).await;
        let binary = client(&communication, Arc::new(BinaryWriterFactory::new()), options(&directory, 5)).await;

        let session = open(&communication, &[Format::Csv, Format::Binary]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();

        session.publish(mean_error(0.5), "DRRC2").unwrap();
        session.mark_group_complete("DRRC2").unwrap();
        session.mark_publication_complete().unwrap();

        let written = session.await_completion(Duration::from_secs(5)).await.unwrap();
        let output = directory.path().join(session.id());
        let expected: BTreeSet<PathBuf> = vec![
            output.join("DRRC2_MEAN_ERROR.bson"),
            output.join("DRRC2_MEAN_ERROR.csv"),
        ]
        .into_iter()
        .collect();

        assert_eq!(written, expected);
        assert_eq!(session.paths_written().unwrap(), expected);
        assert!(expected.iter().all(|path| path.exists()));

        wait_until(|| tabular.in_flight() == 0 && binary.in_flight() == 0).await;
        tabular.stop().await;
        binary.stop().await;

        assert_eq!(tabular.status(), SubscriberStatus::Succeeded);
        assert_eq!(binary.status(), SubscriberStatus::Succeeded);
        assert!(tabular.await_terminal(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn fail_after_too_many_consecutive_skips() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 2)).await;

        let session = open(&communication, &[Format::Csv]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();

        for _ in 0..3 {
            session.publish(unusable(), "DRRC2").unwrap();
        }
        session.mark_publication_complete().unwrap();

        assert!(matches!(
            tabular.await_terminal(Duration::from_secs(5)).await,
            Err(SubscriberError::Failed(_))
        ));
        assert_eq!(tabular.phase(), ClientPhase::Failed);
        assert_eq!(tabular.status(), SubscriberStatus::Failed);

        assert!(matches!(
            session.await_completion(Duration::from_secs(5)).await,
            Err(PublisherError::SubscriberFailed { .. })
        ));

        tabular.stop().await;
        assert_eq!(tabular.phase(), ClientPhase::Stopped);
        assert_eq!(tabular.status(), SubscriberStatus::Failed);
    }

    #[tokio::test]
    async fn tolerate_alternating_skips() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 2)).await;

        let session = open(&communication, &[Format::Csv]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();

        for value in 0..3 {
            session.publish(unusable(), "DRRC2").unwrap();
            session.publish(mean_error(value as f64), "DRRC2").unwrap();
        }
        session.mark_publication_complete().unwrap();

        let written = session.await_completion(Duration::from_secs(5)).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(tabular.status(), SubscriberStatus::Running);

        wait_until(|| tabular.in_flight() == 0).await;
        tabular.stop().await;
        assert_eq!(tabular.status(), SubscriberStatus::Succeeded);
    }

    #[tokio::test]
    async fn report_cancellation_to_pending_waiters() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 5)).await;

        // Never completed, so the evaluation stays in flight until the client is stopped
        let session = open(&communication, &[Format::Csv]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();
        session.publish(mean_error(1.0), "DRRC2").unwrap();
        wait_until(|| tabular.in_flight() == 1).await;

        let (result, _) = tokio::join!(tabular.await_terminal(Duration::from_secs(5)), tabular.stop());

        assert!(matches!(result, Err(SubscriberError::Cancelled { in_flight: 1 })));
        assert_eq!(tabular.status(), SubscriberStatus::Failed);

        session.mark_publication_complete().unwrap();
        assert!(matches!(
            session.await_completion(Duration::from_secs(5)).await,
            Err(PublisherError::SubscriberFailed { .. })
        ));
    }

    #[tokio::test]
    async fn tell_the_publisher_about_abandoned_evaluations() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let options = SubscriberOptions {
            evaluation_idle_timeout: Duration::from_millis(50),
            ..options(&directory, 5)
        };
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options).await;

        let session = open(&communication, &[Format::Csv]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();
        session.publish(mean_error(1.0), "DRRC2").unwrap();

        wait_until(|| tabular.in_flight() == 0).await;
        session.mark_publication_complete().unwrap();

        match session.await_completion(Duration::from_secs(5)).await {
            Err(PublisherError::SubscriberFailed { error, .. }) => {
                assert!(error.to_string().contains("abandoned"))
            }
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(tabular.status(), SubscriberStatus::Running);
        tabular.stop().await;
        assert_eq!(tabular.status(), SubscriberStatus::Succeeded);
    }

    #[tokio::test]
    async fn wait_for_slow_publishers_sending_keep_alives() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let options = SubscriberOptions {
            evaluation_idle_timeout: Duration::from_millis(100),
            ..options(&directory, 5)
        };
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options).await;

        let publisher_options = PublisherOptions {
            keep_alive_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let session = open_with(&communication, &[Format::Csv], publisher_options).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();

        session.publish(mean_error(1.0), "DRRC2").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tabular.in_flight(), 1);

        session.publish(mean_error(2.0), "DRRC2").unwrap();
        session.mark_publication_complete().unwrap();

        let written = session.await_completion(Duration::from_secs(5)).await.unwrap();
        assert_eq!(written.len(), 1);

        wait_until(|| tabular.in_flight() == 0).await;
        tabular.stop().await;
    }

    #[tokio::test]
    async fn ignore_repeated_announcements() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 5)).await;

        let session = open(&communication, &[Format::Csv]).await;
        session
            .wait_for_subscribers(Duration::from_secs(5))
            .await
            .unwrap();

        let announcement = EvaluationAnnouncedNotification {
            descriptor: (*session.descriptor()).clone(),
        };
        let destination = communication
            .route::<EvaluationAnnouncedNotification>(&[])
            .unwrap();
        communication
            .broker()
            .publish(&announcement, &destination)
            .await
            .unwrap();

        session.mark_publication_complete().unwrap();
        session.await_completion(Duration::from_secs(5)).await.unwrap();

        let destination = communication
            .route::<SubscriberNotification>(&[session.id()])
            .unwrap();
        let registrations = communication
            .broker()
            .published::<SubscriberNotification>(destination.address())
            .into_iter()
            .filter(|notification| matches!(notification, SubscriberNotification::Ready { .. }))
            .count();

        assert_eq!(registrations, 1);
        tabular.stop().await;
    }

    #[tokio::test]
    async fn refuse_to_start_twice() {
        let communication = MockCommunicationFactory::default();
        let directory = tempfile::tempdir().unwrap();
        let tabular = client(&communication, Arc::new(TabularWriterFactory::new()), options(&directory, 5)).await;

        assert!(matches!(
            tabular.start().await,
            Err(SubscriberError::InvalidState(ClientPhase::Running))
        ));

        tabular.stop().await;
        tabular.stop().await;
        assert_eq!(tabular.status(), SubscriberStatus::Succeeded);
    }

    #[test]
    fn keep_evaluation_output_inside_root() {
        let root = Path::new("/out");

        assert_eq!(output_directory(root, "e1"), Some(PathBuf::from("/out/e1")));
        assert_eq!(output_directory(root, "../e1"), None);
        assert_eq!(output_directory(root, "a/b"), None);
        assert_eq!(output_directory(root, ""), None);
    }
}
