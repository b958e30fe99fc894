use super::SubscriberOptions;
use crate::domain::Format;
use crate::library::helpers::parse_seconds;
use crate::module::options::BrokerOptions;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

/// Options for the subscriber module
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Output format written by this subscriber
    #[structopt(short, long, env = "SUBSCRIBER_FORMAT", possible_values = &["csv", "binary"])]
    pub format: Format,

    /// Directory below which every evaluation gets its own output directory
    #[structopt(short, long, env = "SUBSCRIBER_OUTPUT", parse(from_os_str))]
    pub output: PathBuf,

    /// Number of consecutive unusable messages tolerated per evaluation
    #[structopt(long, env = "SUBSCRIBER_MAX_SKIPS", default_value = "5")]
    pub max_consecutive_skips: usize,

    /// Seconds without frames after which an evaluation is abandoned, zero waits forever
    #[structopt(long, env = "SUBSCRIBER_IDLE_TIMEOUT", default_value = "300", parse(try_from_str = parse_seconds))]
    pub idle_timeout: Duration,

    /// Seconds between heartbeats sent while an evaluation is consumed, zero disables them
    #[structopt(long, env = "SUBSCRIBER_HEARTBEAT_INTERVAL", default_value = "30", parse(try_from_str = parse_seconds))]
    pub heartbeat_interval: Duration,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,
}

impl Options {
    /// Client tunables derived from these options
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            output_root: self.output.clone(),
            max_consecutive_skips: self.max_consecutive_skips,
            evaluation_idle_timeout: self.idle_timeout,
            heartbeat_interval: self.heartbeat_interval,
            ..Default::default()
        }
    }
}
