use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(about = "Streams evaluation statistics from publishers to subscribers over a message broker.")]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info,hyper=warn,warp=warn",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of log lines
    #[structopt(
        long,
        global = true,
        default_value = "text",
        env = "LOG_FORMAT",
        possible_values = &["text", "compact", "json"]
    )]
    pub log_format: LogFormat,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Runs an embedded broker until terminated
    Broker(evalbus::module::broker::Options),
    /// Writes announced evaluations in one output format until terminated
    Subscriber(evalbus::module::subscriber::Options),
    /// Submits one job to an execution endpoint and prints its outcome
    Submit(evalbus::module::orchestrator::Options),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}
