use super::error::{EvaluationTimeoutError, PublisherError};
use super::tracker::{CompletionTracker, Progress, PublicationViolation};
use crate::constants::destinations::{ACKNOWLEDGEMENTS, STATISTICS};
use crate::domain::event::{EvaluationAnnouncedNotification, EvaluationFrame, SubscriberNotification};
use crate::domain::{
    ConsumerDescription, ConsumerIdentifier, EvaluationDescriptor, EvaluationIdentifier, Format,
    Statistic, StatisticsMessage,
};
use crate::library::communication::event::{
    NotificationPublisher, Subscription, SubscriptionProvider,
};
use crate::library::communication::{
    BlackboxError, CommunicationFactory, Destination, DestinationResolver,
};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

/// Tunables of the publishing side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    /// Interval at which an open evaluation is announced again, zero disables repetition
    pub announcement_interval: Duration,
    /// Interval at which registered subscribers receive keep-alive frames, zero disables them
    pub keep_alive_interval: Duration,
    /// Silence after which a subscriber with outstanding work is considered failed, zero waits forever
    pub subscriber_inactivity_limit: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            announcement_interval: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            subscriber_inactivity_limit: Duration::from_secs(120),
        }
    }
}

/// Entry point for publishing evaluations on a broker
pub struct EvaluationPublisher<F: CommunicationFactory> {
    publisher: F::NotificationPublisher,
    provider: F::SubscriptionProvider,
    announcements: Destination,
    statistics: Destination,
    acknowledgements: Destination,
    options: PublisherOptions,
}

impl<F: CommunicationFactory> EvaluationPublisher<F> {
    /// Resolves all destinations and obtains broker handles from the factory
    pub fn new(factory: &F, options: PublisherOptions) -> Result<Self, PublisherError> {
        Ok(Self {
            publisher: factory.notification_publisher(),
            provider: factory.subscription_provider(),
            announcements: factory.route::<EvaluationAnnouncedNotification>(&[])?,
            statistics: factory.lookup(STATISTICS)?,
            acknowledgements: factory.lookup(ACKNOWLEDGEMENTS)?,
            options,
        })
    }

    /// Opens a session for the evaluation and announces it to subscribers
    #[instrument(skip(self, descriptor), fields(evaluation_id = %descriptor.id))]
    pub async fn open(
        &self,
        descriptor: EvaluationDescriptor,
    ) -> Result<EvaluationSession<F::NotificationPublisher>, PublisherError> {
        let descriptor = Arc::new(descriptor);
        let acknowledgements = self.acknowledgements.extend(&descriptor.id);
        let communication_error = |destination: &Destination, source| {
            PublisherError::Communication {
                evaluation_id: descriptor.id.clone(),
                destination: destination.clone(),
                source,
            }
        };

        let subscription = self
            .provider
            .subscribe::<SubscriberNotification>(&acknowledgements)
            .await
            .map_err(|e| communication_error(&acknowledgements, e))?;

        let (changes_tx, changes_rx) = watch::channel(());
        let shared = Arc::new(Shared {
            descriptor: descriptor.clone(),
            publisher: self.publisher.clone(),
            statistics: self.statistics.extend(&descriptor.id),
            state: Mutex::new(SessionState::default()),
            changes: changes_tx,
        });

        let mut tasks = vec![tokio::spawn(shared.clone().listen(subscription))];

        let announcement = EvaluationAnnouncedNotification {
            descriptor: (*descriptor).clone(),
        };

        if let Err(e) = self
            .publisher
            .publish(&announcement, &self.announcements)
            .await
        {
            for task in tasks {
                task.abort();
            }

            return Err(communication_error(&self.announcements, e));
        }

        if !self.options.announcement_interval.is_zero() {
            tasks.push(tokio::spawn(shared.clone().announce(
                announcement,
                self.announcements.clone(),
                self.options.announcement_interval,
            )));
        }

        if !self.options.keep_alive_interval.is_zero() {
            tasks.push(tokio::spawn(
                shared.clone().keep_alive(self.options.keep_alive_interval),
            ));
        }

        if !self.options.subscriber_inactivity_limit.is_zero() {
            tasks.push(tokio::spawn(
                shared.clone().supervise(self.options.subscriber_inactivity_limit),
            ));
        }

        info!(formats = ?descriptor.formats, "Evaluation announced");

        Ok(EvaluationSession {
            shared,
            changes: changes_rx,
            tasks: Mutex::new(tasks),
        })
    }
}

#[derive(Default)]
struct SessionState {
    tracker: CompletionTracker,
    log: Vec<EvaluationFrame>,
    forwarders: BTreeMap<ConsumerIdentifier, mpsc::UnboundedSender<EvaluationFrame>>,
    closed: bool,
    consumed: bool,
}

impl SessionState {
    /// Appends a frame to the log and hands it to every subscriber
    fn emit(&mut self, frame: EvaluationFrame) {
        self.broadcast(&frame);
        self.log.push(frame);
    }

    /// Hands a frame to every subscriber without replaying it to later ones
    fn broadcast(&mut self, frame: &EvaluationFrame) {
        self.forwarders
            .retain(|_, forwarder| forwarder.send(frame.clone()).is_ok());
    }

    /// Whether background tasks of the session have nothing left to do
    fn is_settled(&self) -> bool {
        self.closed || self.consumed
    }
}

struct Shared<P> {
    descriptor: Arc<EvaluationDescriptor>,
    publisher: P,
    statistics: Destination,
    state: Mutex<SessionState>,
    changes: watch::Sender<()>,
}

impl<P> Shared<P>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send(()).ok();
    }

    fn evaluation_id(&self) -> EvaluationIdentifier {
        self.descriptor.id.clone()
    }

    async fn listen(self: Arc<Self>, mut subscription: Subscription<SubscriberNotification>) {
        while let Some(item) = subscription.next().await {
            match item {
                Ok(notification) => self.handle(notification),
                Err(e) => warn!(error = %e, evaluation_id = %self.descriptor.id, "Discarding malformed subscriber notification"),
            }
        }

        debug!(evaluation_id = %self.descriptor.id, "Acknowledgement subscription ended");
    }

    fn handle(&self, notification: SubscriberNotification) {
        match &notification {
            SubscriberNotification::GroupConsumed { consumer_id, .. }
            | SubscriberNotification::Failed { consumer_id, .. }
            | SubscriberNotification::Alive { consumer_id } => {
                self.state().tracker.touch(consumer_id, Instant::now());
            }
            SubscriberNotification::Ready { .. } => {}
        }

        match notification {
            SubscriberNotification::Ready { consumer } => self.register(consumer),
            SubscriberNotification::Alive { consumer_id } => {
                trace!(evaluation_id = %self.descriptor.id, %consumer_id, "Subscriber alive");
                return;
            }
            SubscriberNotification::GroupConsumed {
                consumer_id,
                group_id,
                paths,
            } => {
                let accepted = self.state().tracker.acknowledge(&consumer_id, &group_id, paths);

                if accepted {
                    debug!(evaluation_id = %self.descriptor.id, %consumer_id, %group_id, "Group consumed");
                } else {
                    warn!(evaluation_id = %self.descriptor.id, %consumer_id, %group_id, "Ignoring acknowledgement of unknown subscriber or group");
                }
            }
            SubscriberNotification::Failed { consumer_id, error } => {
                warn!(evaluation_id = %self.descriptor.id, %consumer_id, %error, "Subscriber failed");
                self.state().tracker.fail(&consumer_id, error);
            }
        }

        self.notify();
    }

    fn register(&self, consumer: ConsumerDescription) {
        let consumer_id = consumer.consumer_id.clone();

        if !self.descriptor.accepts(&consumer.formats) {
            debug!(evaluation_id = %self.descriptor.id, %consumer_id, "Subscriber offers no requested format");
            return;
        }

        let mut state = self.state();

        if state.closed || !state.tracker.register(consumer) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        for frame in &state.log {
            tx.send(frame.clone()).ok();
        }

        state.forwarders.insert(consumer_id.clone(), tx);

        let destination = self.statistics.extend(&consumer_id);
        info!(evaluation_id = %self.descriptor.id, %consumer_id, replayed = state.log.len(), "Subscriber registered");

        tokio::spawn(forward(self.publisher.clone(), destination, rx));
    }

    async fn announce(
        self: Arc<Self>,
        announcement: EvaluationAnnouncedNotification,
        destination: Destination,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if self.state().is_settled() {
                break;
            }

            if let Err(e) = self.publisher.publish(&announcement, &destination).await {
                warn!(error = %e, evaluation_id = %self.descriptor.id, "Failed to repeat announcement");
            } else {
                trace!(evaluation_id = %self.descriptor.id, "Evaluation announced again");
            }
        }
    }
}

impl<P> Shared<P>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
{
    /// Keeps idle subscribers from abandoning the evaluation while statistics are being computed
    async fn keep_alive(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let mut state = self.state();
            if state.is_settled() || state.tracker.is_publication_complete() {
                break;
            }

            state.broadcast(&EvaluationFrame::KeepAlive);
        }
    }

    /// Fails subscribers with outstanding work which have been silent for longer than `limit`
    async fn supervise(self: Arc<Self>, limit: Duration) {
        let mut ticker = tokio::time::interval((limit / 4).max(Duration::from_millis(1)));

        loop {
            ticker.tick().await;

            let mut state = self.state();
            if state.is_settled() {
                break;
            }

            if let Some((consumer_id, silence)) = state.tracker.unresponsive(Instant::now(), limit) {
                warn!(evaluation_id = %self.descriptor.id, %consumer_id, ?silence, "Subscriber stopped responding");

                let error = BlackboxError::from_message(format!(
                    "subscriber {} sent nothing for {:?}",
                    consumer_id, silence
                ));
                state.tracker.fail(&consumer_id, error);
                state.forwarders.remove(&consumer_id);

                drop(state);
                self.notify();
            }
        }
    }
}

/// Publishes the frames of one subscriber in order
async fn forward<P: NotificationPublisher>(
    publisher: P,
    destination: Destination,
    mut frames: mpsc::UnboundedReceiver<EvaluationFrame>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = publisher.publish(&frame, &destination).await {
            warn!(error = %e, %destination, "Failed to forward evaluation frame");
        }
    }
}

/// Publishing side of one evaluation
///
/// Dropping the session closes it.
pub struct EvaluationSession<P>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<P>>,
    changes: watch::Receiver<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P> EvaluationSession<P>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
{
    /// Identifier of the evaluation
    pub fn id(&self) -> &str {
        &self.shared.descriptor.id
    }

    /// Descriptor shared with every subscriber
    pub fn descriptor(&self) -> Arc<EvaluationDescriptor> {
        self.shared.descriptor.clone()
    }

    /// Number of subscribers which registered so far
    pub fn subscriber_count(&self) -> usize {
        self.shared.state().tracker.subscriber_count()
    }

    fn violation(&self, violation: PublicationViolation, group_id: &str) -> PublisherError {
        let evaluation_id = self.shared.evaluation_id();
        let group_id = group_id.to_owned();

        match violation {
            PublicationViolation::GroupClosed => PublisherError::GroupClosed {
                evaluation_id,
                group_id,
            },
            PublicationViolation::UnknownGroup => PublisherError::UnknownGroup {
                evaluation_id,
                group_id,
            },
            PublicationViolation::PublicationComplete => {
                PublisherError::PublicationComplete { evaluation_id }
            }
        }
    }

    fn cancelled(&self) -> PublisherError {
        PublisherError::Cancelled {
            evaluation_id: self.shared.evaluation_id(),
        }
    }

    /// Sends a batch of statistics belonging to a group, returning its sequence number
    ///
    /// Returns immediately, delivery to subscribers happens in the background.
    pub fn publish(&self, statistics: Vec<Statistic>, group_id: &str) -> Result<u64, PublisherError> {
        let mut state = self.shared.state();

        if state.closed {
            return Err(self.cancelled());
        }

        let sequence = state
            .tracker
            .record_message(group_id)
            .map_err(|violation| self.violation(violation, group_id))?;

        state.emit(EvaluationFrame::Statistics(StatisticsMessage {
            evaluation_id: self.shared.evaluation_id(),
            group_id: group_id.to_owned(),
            sequence,
            statistics,
        }));

        trace!(evaluation_id = %self.id(), %group_id, sequence, "Statistics published");

        Ok(sequence)
    }

    /// Closes a group for further messages, repeated calls have no effect
    pub fn mark_group_complete(&self, group_id: &str) -> Result<(), PublisherError> {
        let mut state = self.shared.state();

        if state.closed {
            return Err(self.cancelled());
        }

        let closed = state
            .tracker
            .close_group(group_id)
            .map_err(|violation| self.violation(violation, group_id))?;

        if let Some(message_count) = closed {
            debug!(evaluation_id = %self.id(), %group_id, message_count, "Group complete");
            state.emit(EvaluationFrame::GroupComplete {
                group_id: group_id.to_owned(),
                message_count,
            });
        }

        Ok(())
    }

    /// Declares that no further groups will be opened, closing every open group
    pub fn mark_publication_complete(&self) -> Result<(), PublisherError> {
        let mut state = self.shared.state();

        if state.closed {
            return Err(self.cancelled());
        }

        if let Some(closed) = state.tracker.complete_publication() {
            for (group_id, message_count) in closed {
                state.emit(EvaluationFrame::GroupComplete {
                    group_id,
                    message_count,
                });
            }

            let group_count = state.tracker.group_count();
            let message_count = state.tracker.message_count();
            state.emit(EvaluationFrame::PublicationComplete {
                group_count,
                message_count,
            });

            info!(evaluation_id = %self.id(), group_count, message_count, "Publication complete");
        }

        drop(state);
        self.shared.notify();

        Ok(())
    }

    /// Waits until every registered subscriber consumed every group and returns the artifacts written
    #[instrument(skip(self), fields(evaluation_id = %self.id()))]
    pub async fn await_completion(&self, limit: Duration) -> Result<BTreeSet<PathBuf>, PublisherError> {
        {
            let state = self.shared.state();

            if state.closed {
                return Err(self.cancelled());
            }

            if !state.tracker.is_publication_complete() {
                return Err(PublisherError::PublicationNotComplete {
                    evaluation_id: self.shared.evaluation_id(),
                });
            }
        }

        let mut changes = self.changes.clone();
        let wait = async {
            loop {
                if let Some(result) = self.settle() {
                    return result;
                }

                if changes.changed().await.is_err() {
                    return Err(self.cancelled());
                }
            }
        };

        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                let pending = self.shared.state().tracker.pending();
                warn!(pending = pending.len(), "Evaluation not consumed in time");

                Err(EvaluationTimeoutError {
                    evaluation_id: self.shared.evaluation_id(),
                    timeout: limit,
                    pending,
                }
                .into())
            }
        }
    }

    fn settle(&self) -> Option<Result<BTreeSet<PathBuf>, PublisherError>> {
        let mut state = self.shared.state();

        if state.closed {
            return Some(Err(self.cancelled()));
        }

        match state.tracker.progress() {
            Progress::Consumed => {
                state.consumed = true;
                info!(paths = state.tracker.paths().len(), "Evaluation consumed");
                Some(Ok(state.tracker.paths().clone()))
            }
            Progress::Failed { consumer_id, error } => Some(Err(PublisherError::SubscriberFailed {
                evaluation_id: self.shared.evaluation_id(),
                consumer_id,
                error,
            })),
            Progress::Publishing | Progress::Pending(_) => None,
        }
    }

    /// Artifacts written by all subscribers, available once the evaluation has been consumed
    pub fn paths_written(&self) -> Result<BTreeSet<PathBuf>, PublisherError> {
        let state = self.shared.state();

        if state.consumed {
            Ok(state.tracker.paths().clone())
        } else {
            Err(PublisherError::NotConsumed {
                evaluation_id: self.shared.evaluation_id(),
            })
        }
    }

    /// Waits until every declared format is offered by at least one registered subscriber
    #[instrument(skip(self), fields(evaluation_id = %self.id()))]
    pub async fn wait_for_subscribers(&self, limit: Duration) -> Result<(), PublisherError> {
        let mut changes = self.changes.clone();
        let wait = async {
            loop {
                if self.missing_formats().is_empty() {
                    return Ok(());
                }

                let closed = self.shared.state().closed;
                if closed || changes.changed().await.is_err() {
                    return Err(self.cancelled());
                }
            }
        };

        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(PublisherError::SubscribersUnavailable {
                evaluation_id: self.shared.evaluation_id(),
                missing: self.missing_formats(),
            }),
        }
    }

    fn missing_formats(&self) -> Vec<Format> {
        let offered = self.shared.state().tracker.offered_formats();

        self.shared
            .descriptor
            .formats
            .difference(&offered)
            .copied()
            .collect()
    }

    /// Tells every subscriber that the evaluation failed on the publishing side and closes the session
    #[instrument(skip(self), fields(evaluation_id = %self.id()))]
    pub fn stop(&self, reason: &str) {
        {
            let mut state = self.shared.state();

            if state.closed {
                return;
            }

            warn!("Stopping evaluation");
            state.emit(EvaluationFrame::Stopped {
                reason: reason.to_owned(),
            });
        }

        self.close();
    }

    /// Releases broker resources of this session, safe to call repeatedly
    ///
    /// Frames already handed to subscribers are still delivered, pending waits return [`PublisherError::Cancelled`].
    pub fn close(&self) {
        {
            let mut state = self.shared.state();

            if state.closed {
                return;
            }

            state.closed = true;
            state.forwarders.clear();
        }

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for task in tasks {
            task.abort();
        }

        self.shared.notify();
        debug!(evaluation_id = %self.id(), "Session closed");
    }
}

impl<P> Drop for EvaluationSession<P>
where
    P: NotificationPublisher + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::MeasurementMetadata;
    use crate::library::communication::implementation::mock::{MockBroker, MockCommunicationFactory};
    use pretty_assertions::assert_eq;

    type Session = EvaluationSession<MockBroker>;

    fn descriptor(formats: &[Format]) -> EvaluationDescriptor {
        EvaluationDescriptor::new(
            formats.iter().copied(),
            MeasurementMetadata {
                variable: "streamflow".into(),
                unit: "CMS".into(),
                labels: Default::default(),
            },
        )
    }

    fn consumer(id: &str, format: Format) -> ConsumerDescription {
        ConsumerDescription {
            consumer_id: id.into(),
            formats: vec![format].into_iter().collect(),
        }
    }

    fn statistics(value: f64) -> Vec<Statistic> {
        vec![Statistic::new("MEAN_ERROR", "0-6h", value)]
    }

    fn paths(names: &[&str]) -> BTreeSet<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    async fn open(
        factory: &MockCommunicationFactory,
        formats: &[Format],
        options: PublisherOptions,
    ) -> Session {
        EvaluationPublisher::new(factory, options)
            .unwrap()
            .open(descriptor(formats))
            .await
            .unwrap()
    }

    async fn send(factory: &MockCommunicationFactory, session: &Session, notification: SubscriberNotification) {
        let destination = factory
            .route::<SubscriberNotification>(&[session.id()])
            .unwrap();

        factory
            .broker()
            .publish(&notification, &destination)
            .await
            .unwrap();
    }

    /// Subscribes like a subscriber class would and returns its frame stream
    async fn join(
        factory: &MockCommunicationFactory,
        session: &Session,
        consumer: ConsumerDescription,
    ) -> Subscription<EvaluationFrame> {
        let destination = factory
            .route::<EvaluationFrame>(&[session.id(), consumer.consumer_id.as_str()])
            .unwrap();
        let frames = factory
            .broker()
            .subscribe::<EvaluationFrame>(&destination)
            .await
            .unwrap();

        let expected = session.subscriber_count() + 1;
        send(factory, session, SubscriberNotification::Ready { consumer }).await;

        timeout(Duration::from_secs(5), async {
            while session.subscriber_count() < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        frames
    }

    async fn next_frame(frames: &mut Subscription<EvaluationFrame>) -> EvaluationFrame {
        timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn consumed(
        factory: &MockCommunicationFactory,
        session: &Session,
        consumer_id: &str,
        group_id: &str,
        written: &[&str],
    ) {
        send(
            factory,
            session,
            SubscriberNotification::GroupConsumed {
                consumer_id: consumer_id.into(),
                group_id: group_id.into(),
                paths: paths(written),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn complete_immediately_without_groups() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;

        assert!(matches!(
            session.paths_written(),
            Err(PublisherError::NotConsumed { .. })
        ));

        session.mark_publication_complete().unwrap();
        let written = session.await_completion(Duration::from_secs(1)).await.unwrap();

        assert!(written.is_empty());
        assert!(session.paths_written().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refuse_await_before_publication_complete() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;
        session.publish(statistics(1.0), "DRRC2").unwrap();

        assert!(matches!(
            session.await_completion(Duration::from_secs(1)).await,
            Err(PublisherError::PublicationNotComplete { .. })
        ));
    }

    #[tokio::test]
    async fn announce_evaluations() {
        let factory = MockCommunicationFactory::default();
        let options = PublisherOptions {
            announcement_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let session = open(&factory, &[Format::Csv], options).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let announcements = factory
            .broker()
            .published::<EvaluationAnnouncedNotification>("evaluation.announcements");

        assert!(announcements.len() >= 2);
        assert_eq!(announcements[0].descriptor.id, session.id());
    }

    #[tokio::test]
    async fn reject_out_of_order_publications() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;

        assert_eq!(session.publish(statistics(1.0), "a").unwrap(), 1);
        assert_eq!(session.publish(statistics(2.0), "b").unwrap(), 2);

        session.mark_group_complete("a").unwrap();
        session.mark_group_complete("a").unwrap();

        assert!(matches!(
            session.publish(statistics(3.0), "a"),
            Err(PublisherError::GroupClosed { .. })
        ));
        assert!(matches!(
            session.mark_group_complete("c"),
            Err(PublisherError::UnknownGroup { .. })
        ));

        session.mark_publication_complete().unwrap();
        session.mark_publication_complete().unwrap();

        assert!(matches!(
            session.publish(statistics(4.0), "c"),
            Err(PublisherError::PublicationComplete { .. })
        ));
    }

    #[tokio::test]
    async fn replay_frames_to_late_subscribers() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;

        session.publish(statistics(1.0), "DRRC2").unwrap();
        session.publish(statistics(2.0), "DRRC2").unwrap();
        session.mark_group_complete("DRRC2").unwrap();
        session.mark_group_complete("DRRC2").unwrap();

        let mut frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;
        session.mark_publication_complete().unwrap();

        let sequences: Vec<u64> = vec![next_frame(&mut frames).await, next_frame(&mut frames).await]
            .into_iter()
            .map(|frame| match frame {
                EvaluationFrame::Statistics(message) => message.sequence,
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();

        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(
            next_frame(&mut frames).await,
            EvaluationFrame::GroupComplete {
                group_id: "DRRC2".into(),
                message_count: 2
            }
        );
        assert_eq!(
            next_frame(&mut frames).await,
            EvaluationFrame::PublicationComplete {
                group_count: 1,
                message_count: 2
            }
        );
    }

    #[tokio::test]
    async fn ignore_subscribers_without_requested_formats() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;

        send(
            &factory,
            &session,
            SubscriberNotification::Ready {
                consumer: consumer("png-1", Format::Png),
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_every_subscriber_class() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv, Format::Binary], Default::default()).await;

        let _csv = join(&factory, &session, consumer("csv-1", Format::Csv)).await;
        let _binary = join(&factory, &session, consumer("binary-1", Format::Binary)).await;
        session
            .wait_for_subscribers(Duration::from_secs(1))
            .await
            .unwrap();

        session.publish(statistics(1.0), "a").unwrap();
        session.publish(statistics(2.0), "b").unwrap();
        session.mark_publication_complete().unwrap();

        consumed(&factory, &session, "csv-1", "a", &["a_MEAN_ERROR.csv"]).await;
        consumed(&factory, &session, "csv-1", "b", &["b_MEAN_ERROR.csv"]).await;
        consumed(&factory, &session, "binary-1", "a", &["a_MEAN_ERROR.bson"]).await;

        match session.await_completion(Duration::from_millis(100)).await {
            Err(PublisherError::Timeout(error)) => assert_eq!(
                error.pending.iter().map(ToString::to_string).collect::<Vec<_>>(),
                vec!["b@binary-1"]
            ),
            other => panic!("unexpected result {:?}", other),
        }

        consumed(&factory, &session, "binary-1", "b", &["b_MEAN_ERROR.bson", "b_MEAN_ERROR.csv"]).await;

        let written = session.await_completion(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            written,
            paths(&[
                "a_MEAN_ERROR.bson",
                "a_MEAN_ERROR.csv",
                "b_MEAN_ERROR.bson",
                "b_MEAN_ERROR.csv"
            ])
        );
        assert_eq!(session.paths_written().unwrap(), written);
    }

    #[tokio::test]
    async fn fail_when_a_subscriber_fails() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;
        let _frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        session.publish(statistics(1.0), "a").unwrap();
        session.mark_publication_complete().unwrap();
        send(
            &factory,
            &session,
            SubscriberNotification::Failed {
                consumer_id: "csv-1".into(),
                error: BlackboxError::from_message("disk full"),
            },
        )
        .await;

        match session.await_completion(Duration::from_secs(1)).await {
            Err(PublisherError::SubscriberFailed { consumer_id, error, .. }) => {
                assert_eq!(consumer_id, "csv-1");
                assert_eq!(error.to_string(), "disk full");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_pending_waits_on_close() {
        let factory = MockCommunicationFactory::default();
        let session = Arc::new(open(&factory, &[Format::Csv], Default::default()).await);
        let _frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        session.publish(statistics(1.0), "a").unwrap();
        session.mark_publication_complete().unwrap();

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.await_completion(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close();
        session.close();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(PublisherError::Cancelled { .. })
        ));
        assert!(matches!(
            session.publish(statistics(1.0), "b"),
            Err(PublisherError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn notify_subscribers_when_stopped() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv], Default::default()).await;
        let mut frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        session.stop("metric computation failed");

        assert_eq!(
            next_frame(&mut frames).await,
            EvaluationFrame::Stopped {
                reason: "metric computation failed".into()
            }
        );
    }

    #[tokio::test]
    async fn name_formats_nobody_offers() {
        let factory = MockCommunicationFactory::default();
        let session = open(&factory, &[Format::Csv, Format::Binary], Default::default()).await;
        let _frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        match session.wait_for_subscribers(Duration::from_millis(50)).await {
            Err(PublisherError::SubscribersUnavailable { missing, .. }) => {
                assert_eq!(missing, vec![Format::Binary])
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn keep_subscribers_alive_without_replaying_keep_alives() {
        let factory = MockCommunicationFactory::default();
        let options = PublisherOptions {
            keep_alive_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let session = open(&factory, &[Format::Csv], options).await;
        let mut early = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        assert_eq!(next_frame(&mut early).await, EvaluationFrame::KeepAlive);

        session.publish(statistics(1.0), "a").unwrap();
        let mut late = join(&factory, &session, consumer("csv-2", Format::Csv)).await;

        assert!(matches!(
            next_frame(&mut late).await,
            EvaluationFrame::Statistics(_)
        ));
    }

    #[tokio::test]
    async fn fail_silent_subscribers() {
        let factory = MockCommunicationFactory::default();
        let options = PublisherOptions {
            subscriber_inactivity_limit: Duration::from_millis(50),
            ..Default::default()
        };
        let session = open(&factory, &[Format::Csv], options).await;
        let _frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        session.publish(statistics(1.0), "a").unwrap();
        session.mark_publication_complete().unwrap();

        match session.await_completion(Duration::from_secs(5)).await {
            Err(PublisherError::SubscriberFailed { consumer_id, error, .. }) => {
                assert_eq!(consumer_id, "csv-1");
                assert!(error.to_string().contains("sent nothing"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn trust_subscribers_sending_heartbeats() {
        let factory = MockCommunicationFactory::default();
        let options = PublisherOptions {
            subscriber_inactivity_limit: Duration::from_millis(100),
            ..Default::default()
        };
        let session = open(&factory, &[Format::Csv], options).await;
        let _frames = join(&factory, &session, consumer("csv-1", Format::Csv)).await;

        session.publish(statistics(1.0), "a").unwrap();
        session.mark_publication_complete().unwrap();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            send(
                &factory,
                &session,
                SubscriberNotification::Alive {
                    consumer_id: "csv-1".into(),
                },
            )
            .await;
        }

        consumed(&factory, &session, "csv-1", "a", &["a.csv"]).await;

        let written = session.await_completion(Duration::from_secs(5)).await.unwrap();
        assert_eq!(written, paths(&["a.csv"]));
    }
}
