use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a job, assigned by the submitter
pub type JobIdentifier = String;

/// Resources an evaluation job is expected to need
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Expected peak memory in megabytes
    pub memory_mb: Option<u64>,
    /// Number of processors the job may use
    pub cpus: Option<u32>,
}

/// Encoded request for one evaluation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Identifier under which status transitions are published
    pub job_id: JobIdentifier,
    /// Evaluation declaration, opaque to this crate
    pub declaration: String,
    /// Resource hints passed along with the declaration
    #[serde(default)]
    pub resources: ResourceHints,
}

impl JobDescriptor {
    /// Creates a descriptor with a random job identifier
    pub fn new(declaration: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            declaration: declaration.into(),
            resources: ResourceHints::default(),
        }
    }

    /// Replaces the job identifier
    pub fn with_job_id(mut self, job_id: impl Into<JobIdentifier>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Replaces the resource hints
    pub fn with_resources(mut self, resources: ResourceHints) -> Self {
        self.resources = resources;
        self
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Accepted by the execution endpoint
    Submitted,
    /// Executing
    InProgress,
    /// Finished and produced its outputs
    Completed,
    /// Finished without producing its outputs
    Failed,
    /// Exceeded the maximum wall-clock duration
    TimedOut,
}

impl JobStatus {
    /// Whether no further transitions follow this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed-out",
        };

        f.write_str(text)
    }
}
