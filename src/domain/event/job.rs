use crate::constants::destinations::JOB_STATUS;
use crate::domain::{JobIdentifier, JobStatus};
use crate::library::communication::event::Notification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job transitioned into a new status
///
/// Sent on the job status destination extended by the job id. Observers must order
/// notifications of one job by `sequence` as delivery order is not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusNotification {
    /// Job which transitioned
    pub job_id: JobIdentifier,
    /// Strictly increasing per job, starting at one
    pub sequence: u64,
    /// Status the job transitioned into
    pub status: JobStatus,
    /// Identifier assigned by the execution endpoint, once known
    pub evaluation_id: Option<String>,
    /// Additional human readable information
    pub detail: Option<String>,
    /// Point in time the transition was observed
    pub timestamp: DateTime<Utc>,
}

impl Notification for JobStatusNotification {
    const DESTINATION: &'static str = JOB_STATUS;
}
