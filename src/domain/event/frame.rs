use crate::constants::destinations::STATISTICS;
use crate::domain::{GroupIdentifier, StatisticsMessage};
use crate::library::communication::event::Notification;
use serde::{Deserialize, Serialize};

/// Unit of the ordered per-subscriber stream of one evaluation
///
/// Sent on the statistics destination extended by evaluation and consumer id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationFrame {
    /// A batch of statistics
    Statistics(StatisticsMessage),
    /// No more statistics will be sent for a group
    GroupComplete {
        /// Group that has been closed
        group_id: GroupIdentifier,
        /// Number of statistics frames sent for the group
        message_count: u64,
    },
    /// No more groups will be opened
    PublicationComplete {
        /// Number of groups in the evaluation
        group_count: u64,
        /// Number of statistics frames in the evaluation
        message_count: u64,
    },
    /// The publisher gave up on the evaluation
    Stopped {
        /// Human readable cause
        reason: String,
    },
    /// The publisher is still working on the evaluation, carries no data
    KeepAlive,
}

impl Notification for EvaluationFrame {
    const DESTINATION: &'static str = STATISTICS;
}
