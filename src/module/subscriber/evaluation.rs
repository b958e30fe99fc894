use super::{Artifacts, ConsumerError, GroupConsumer, MessageConsumer};
use crate::domain::event::{EvaluationFrame, SubscriberNotification};
use crate::domain::{ConsumerIdentifier, EvaluationDescriptor, GroupIdentifier, StatisticsMessage};
use crate::library::communication::event::{NotificationPublisher, Subscription};
use crate::library::communication::Destination;
use crate::library::BoxedError;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{spawn_blocking, JoinError};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

/// Unrecoverable failure while consuming one evaluation
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// Output directory could not be created
    #[error("unable to create output directory {}", path.display())]
    OutputDirectory {
        /// Directory which could not be created
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Consumer factory refused to build consumers
    #[error("unable to build consumers")]
    Setup(#[source] ConsumerError),
    /// Broker interaction failed
    #[error("unable to communicate on {destination}")]
    Communication {
        /// Destination involved
        destination: Destination,
        /// Underlying error
        #[source]
        source: BoxedError,
    },
    /// Message consumer failed irrecoverably
    #[error("unable to consume message {sequence} of group {group_id}")]
    Message {
        /// Group of the message
        group_id: GroupIdentifier,
        /// Sequence number of the message
        sequence: u64,
        /// Underlying error
        #[source]
        source: ConsumerError,
    },
    /// Group consumer failed irrecoverably
    #[error("unable to consume group {group_id}")]
    Group {
        /// Group which failed
        group_id: GroupIdentifier,
        /// Underlying error
        #[source]
        source: ConsumerError,
    },
    /// Too many messages in a row could not be consumed
    #[error("giving up after {skipped} consecutive unusable messages")]
    TooManySkips {
        /// Number of consecutive failures
        skipped: usize,
        /// Error of the last failed message
        #[source]
        last: ConsumerError,
    },
    /// Number of messages received for a group differs from what the publisher sent
    #[error("group {group_id} was closed after {expected} messages but {received} arrived")]
    MessageCountMismatch {
        /// Group which has been closed
        group_id: GroupIdentifier,
        /// Messages sent by the publisher
        expected: u64,
        /// Messages received
        received: u64,
    },
    /// The statistics subscription ended before the publication completed
    #[error("statistics stream ended before the publication completed")]
    StreamEnded,
    /// A consumer panicked
    #[error("consumer task did not finish")]
    Panicked(#[from] JoinError),
}

/// How consumption of an evaluation ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Every group has been consumed
    Consumed,
    /// The publisher stopped the evaluation for the contained reason
    Stopped(String),
    /// The subscriber gave up on the evaluation for the contained reason
    Abandoned(String),
}

/// Counts consecutive recoverable failures
///
/// Exceeding the configured number of consecutive failures escalates to an unrecoverable failure.
/// Any success resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    max_consecutive: usize,
    consecutive: usize,
}

impl FailurePolicy {
    /// Creates a policy tolerating up to `max_consecutive` failures in a row
    pub fn new(max_consecutive: usize) -> Self {
        Self {
            max_consecutive,
            consecutive: 0,
        }
    }

    /// Resets the count
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Counts a failure and returns whether it has to be escalated
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive > self.max_consecutive
    }

    /// Current number of failures in a row
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }
}

#[derive(Default)]
struct GroupBuffer {
    messages: Vec<StatisticsMessage>,
    received: u64,
    artifacts: Artifacts,
}

/// Consumption of the frame stream of one evaluation by one subscriber class
pub(super) struct EvaluationRun<P> {
    descriptor: Arc<EvaluationDescriptor>,
    consumer_id: ConsumerIdentifier,
    publisher: P,
    acknowledgements: Destination,
    message_consumer: MessageConsumer,
    group_consumer: GroupConsumer,
    policy: FailurePolicy,
    idle_timeout: Duration,
    heartbeat_interval: Duration,
    groups: HashMap<GroupIdentifier, GroupBuffer>,
    undecodable: u64,
}

impl<P: NotificationPublisher + Send + Sync> EvaluationRun<P> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        descriptor: Arc<EvaluationDescriptor>,
        consumer_id: ConsumerIdentifier,
        publisher: P,
        acknowledgements: Destination,
        message_consumer: MessageConsumer,
        group_consumer: GroupConsumer,
        policy: FailurePolicy,
        idle_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            descriptor,
            consumer_id,
            publisher,
            acknowledgements,
            message_consumer,
            group_consumer,
            policy,
            idle_timeout,
            heartbeat_interval,
            groups: HashMap::new(),
            undecodable: 0,
        }
    }

    /// Consumes frames until the publication completes, the publisher stops or the stream goes idle
    #[instrument(skip(self, frames), fields(evaluation_id = %self.descriptor.id, consumer_id = %self.consumer_id))]
    pub(super) async fn run(
        mut self,
        mut frames: Subscription<EvaluationFrame>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        // interval panics on a zero period, the branch is disabled in that case anyway
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut idle_deadline = Instant::now() + self.idle_timeout;

        loop {
            let item = tokio::select! {
                item = frames.next() => item,
                _ = sleep_until(idle_deadline), if !self.idle_timeout.is_zero() => {
                    let reason = format!("no frames received for {:?}", self.idle_timeout);
                    return Ok(EvaluationOutcome::Abandoned(reason));
                }
                _ = heartbeat.tick(), if !self.heartbeat_interval.is_zero() => {
                    self.send_heartbeat().await;
                    continue;
                }
            };

            idle_deadline = Instant::now() + self.idle_timeout;

            match item {
                Some(Ok(EvaluationFrame::Statistics(message))) => self.consume_message(message).await?,
                Some(Ok(EvaluationFrame::GroupComplete {
                    group_id,
                    message_count,
                })) => self.consume_group(group_id, message_count).await?,
                Some(Ok(EvaluationFrame::PublicationComplete {
                    group_count,
                    message_count,
                })) => {
                    if !self.groups.is_empty() {
                        warn!(open = self.groups.len(), "Publication completed with groups that were never closed");
                    }

                    debug!(group_count, message_count, "Publication complete");
                    return Ok(EvaluationOutcome::Consumed);
                }
                Some(Ok(EvaluationFrame::Stopped { reason })) => {
                    return Ok(EvaluationOutcome::Stopped(reason));
                }
                Some(Ok(EvaluationFrame::KeepAlive)) => trace!("Publisher alive"),
                Some(Err(e)) => {
                    self.undecodable += 1;
                    self.skip(ConsumerError::Recoverable(e))?;
                }
                None => return Err(EvaluationError::StreamEnded),
            }
        }
    }

    async fn send_heartbeat(&self) {
        let notification = SubscriberNotification::Alive {
            consumer_id: self.consumer_id.clone(),
        };

        match self.publisher.publish(&notification, &self.acknowledgements).await {
            Ok(()) => trace!("Heartbeat sent"),
            Err(e) => warn!(error = %e, "Unable to send heartbeat"),
        }
    }

    async fn consume_message(&mut self, message: StatisticsMessage) -> Result<(), EvaluationError> {
        let consumer = self.message_consumer.clone();
        let (message, result) = spawn_blocking(move || {
            let result = consumer(&message);
            (message, result)
        })
        .await?;

        let group = self.groups.entry(message.group_id.clone()).or_default();
        group.received += 1;

        match result {
            Ok(artifacts) => {
                trace!(group_id = %message.group_id, sequence = message.sequence, "Message consumed");
                group.artifacts.extend(artifacts);
                group.messages.push(message);
                self.policy.record_success();
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(group_id = %message.group_id, sequence = message.sequence, error = %chain(&e), "Skipping message");
                self.skip(e)
            }
            Err(e) => Err(EvaluationError::Message {
                group_id: message.group_id,
                sequence: message.sequence,
                source: e,
            }),
        }
    }

    fn skip(&mut self, error: ConsumerError) -> Result<(), EvaluationError> {
        if self.policy.record_failure() {
            Err(EvaluationError::TooManySkips {
                skipped: self.policy.consecutive(),
                last: error,
            })
        } else {
            debug!(consecutive = self.policy.consecutive(), error = %chain(&error), "Recoverable consumer failure");
            Ok(())
        }
    }

    async fn consume_group(
        &mut self,
        group_id: GroupIdentifier,
        message_count: u64,
    ) -> Result<(), EvaluationError> {
        let group = self.groups.remove(&group_id).unwrap_or_default();

        // Undecodable frames can not be attributed to a group, they may account for missing messages
        let missing = message_count.saturating_sub(group.received);
        if group.received > message_count || missing > self.undecodable {
            return Err(EvaluationError::MessageCountMismatch {
                group_id,
                expected: message_count,
                received: group.received,
            });
        }
        self.undecodable -= missing;

        let consumer = self.group_consumer.clone();
        let messages = group.messages;
        let result = spawn_blocking(move || consumer(messages.as_slice())).await?;

        let mut paths = group.artifacts;
        match result {
            Ok(artifacts) => paths.extend(artifacts),
            Err(e) if e.is_recoverable() => {
                warn!(%group_id, error = %chain(&e), "Group consumer skipped the group");
            }
            Err(e) => return Err(EvaluationError::Group { group_id, source: e }),
        }

        debug!(%group_id, paths = paths.len(), "Group consumed");

        let notification = SubscriberNotification::GroupConsumed {
            consumer_id: self.consumer_id.clone(),
            group_id,
            paths,
        };

        self.publisher
            .publish(&notification, &self.acknowledgements)
            .await
            .map_err(|source| EvaluationError::Communication {
                destination: self.acknowledgements.clone(),
                source,
            })
    }
}

/// Renders the full cause chain of a consumer error
fn chain(error: &ConsumerError) -> crate::library::communication::BlackboxError {
    (error as &(dyn std::error::Error + 'static)).into()
}
