use crate::constants::destinations::EVALUATIONS;
use crate::domain::EvaluationDescriptor;
use crate::library::communication::event::Notification;
use serde::{Deserialize, Serialize};

/// Evaluation has been opened and is looking for subscribers
///
/// Sent repeatedly while the evaluation is being published so that subscribers
/// starting late still discover it. Receivers must treat duplicates as no-ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationAnnouncedNotification {
    /// Descriptor of the announced evaluation
    pub descriptor: EvaluationDescriptor,
}

impl Notification for EvaluationAnnouncedNotification {
    const DESTINATION: &'static str = EVALUATIONS;
}
