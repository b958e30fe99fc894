use super::OrchestratorOptions;
use crate::domain::ResourceHints;
use crate::library::helpers::parse_seconds;
use crate::module::options::BrokerOptions;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

/// Options for submitting a job
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Base URL of the execution endpoint
    #[structopt(short, long, env = "EXECUTION_ENDPOINT", default_value = "http://localhost:8010")]
    pub endpoint: String,

    /// File containing the evaluation declaration
    #[structopt(parse(from_os_str))]
    pub declaration: PathBuf,

    /// Identifier under which status transitions are published, random if omitted
    #[structopt(long)]
    pub job_id: Option<String>,

    /// Seconds between two status polls
    #[structopt(long, env = "JOB_POLL_INTERVAL", default_value = "2", parse(try_from_str = parse_seconds))]
    pub poll_interval: Duration,

    /// Seconds after which a job without terminal status is considered timed out
    #[structopt(long, env = "JOB_MAX_DURATION", default_value = "43200", parse(try_from_str = parse_seconds))]
    pub max_duration: Duration,

    /// Expected peak memory of the job in megabytes
    #[structopt(long)]
    pub memory_mb: Option<u64>,

    /// Number of processors the job may use
    #[structopt(long)]
    pub cpus: Option<u32>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,
}

impl Options {
    /// Orchestrator tunables derived from these options
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            poll_interval: self.poll_interval,
            max_duration: self.max_duration,
            ..Default::default()
        }
    }

    /// Resource hints attached to the submitted job
    pub fn resources(&self) -> ResourceHints {
        ResourceHints {
            memory_mb: self.memory_mb,
            cpus: self.cpus,
        }
    }
}
