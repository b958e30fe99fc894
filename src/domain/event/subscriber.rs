use crate::constants::destinations::ACKNOWLEDGEMENTS;
use crate::domain::{ConsumerDescription, ConsumerIdentifier, GroupIdentifier};
use crate::library::communication::event::Notification;
use crate::library::communication::BlackboxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Message from a subscriber class to the publisher of an evaluation
///
/// Sent on the acknowledgement destination extended by the evaluation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberNotification {
    /// Subscriber listens on its statistics destination and wants to receive the evaluation
    Ready {
        /// Identity and formats of the subscriber
        consumer: ConsumerDescription,
    },
    /// Subscriber consumed every message of a closed group
    GroupConsumed {
        /// Subscriber which consumed the group
        consumer_id: ConsumerIdentifier,
        /// Group which has been consumed
        group_id: GroupIdentifier,
        /// Artifacts written while consuming the group
        paths: BTreeSet<PathBuf>,
    },
    /// Subscriber failed irrecoverably and will not acknowledge further groups
    Failed {
        /// Subscriber which failed
        consumer_id: ConsumerIdentifier,
        /// Cause chain of the failure
        error: BlackboxError,
    },
    /// Subscriber is still consuming the evaluation
    Alive {
        /// Subscriber which is alive
        consumer_id: ConsumerIdentifier,
    },
}

impl Notification for SubscriberNotification {
    const DESTINATION: &'static str = ACKNOWLEDGEMENTS;
}
