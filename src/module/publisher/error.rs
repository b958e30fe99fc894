use crate::domain::{ConsumerIdentifier, EvaluationIdentifier, Format, GroupIdentifier};
use crate::library::communication::{BlackboxError, Destination, DestinationNotFoundError};
use crate::library::BoxedError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Acknowledgement which has not been received yet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingAcknowledgement {
    /// Group which has not been acknowledged
    pub group_id: GroupIdentifier,
    /// Subscriber which has not acknowledged the group
    pub consumer_id: ConsumerIdentifier,
}

impl fmt::Display for PendingAcknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.group_id, self.consumer_id)
    }
}

/// Subscribers did not consume the evaluation in time
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("evaluation {evaluation_id} not consumed within {timeout:?}, pending: {}", list(.pending))]
pub struct EvaluationTimeoutError {
    /// Evaluation which timed out
    pub evaluation_id: EvaluationIdentifier,
    /// Time waited
    pub timeout: Duration,
    /// Acknowledgements still outstanding, sorted by group
    pub pending: Vec<PendingAcknowledgement>,
}

fn list(pending: &[PendingAcknowledgement]) -> String {
    if pending.is_empty() {
        return "none".into();
    }

    pending
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by an [`EvaluationSession`](super::EvaluationSession)
#[derive(Debug, Error)]
pub enum PublisherError {
    /// Destination required by the session is not configured
    #[error("destination of evaluation is not configured")]
    Destination(#[from] DestinationNotFoundError),
    /// Broker rejected an operation
    #[error("broker operation on {destination} failed for evaluation {evaluation_id}")]
    Communication {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
        /// Destination involved
        destination: Destination,
        /// Underlying cause
        #[source]
        source: BoxedError,
    },
    /// Group has already been closed
    #[error("group {group_id} of evaluation {evaluation_id} is closed")]
    GroupClosed {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
        /// Closed group
        group_id: GroupIdentifier,
    },
    /// Group has never received a message
    #[error("group {group_id} of evaluation {evaluation_id} is unknown")]
    UnknownGroup {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
        /// Unknown group
        group_id: GroupIdentifier,
    },
    /// Publication has been declared complete
    #[error("publication of evaluation {evaluation_id} is already complete")]
    PublicationComplete {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
    },
    /// Publication has to be declared complete first
    #[error("publication of evaluation {evaluation_id} has not been marked complete")]
    PublicationNotComplete {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
    },
    /// Results are only available after a successful await
    #[error("evaluation {evaluation_id} has not been consumed yet")]
    NotConsumed {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
    },
    /// Subscribers did not acknowledge in time
    #[error(transparent)]
    Timeout(#[from] EvaluationTimeoutError),
    /// A subscriber reported an unrecoverable failure
    #[error("subscriber {consumer_id} failed to consume evaluation {evaluation_id}: {error}")]
    SubscriberFailed {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
        /// Subscriber which failed
        consumer_id: ConsumerIdentifier,
        /// Cause reported by the subscriber
        error: BlackboxError,
    },
    /// Not every declared format is offered by a subscriber
    #[error("no subscriber for formats {missing:?} of evaluation {evaluation_id}")]
    SubscribersUnavailable {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
        /// Formats nobody offered
        missing: Vec<Format>,
    },
    /// Session has been closed
    #[error("session of evaluation {evaluation_id} has been closed")]
    Cancelled {
        /// Affected evaluation
        evaluation_id: EvaluationIdentifier,
    },
}
