use anyhow::Result;
use evalbus::harness::ModuleRunner;
use evalbus::module::broker::Broker;
use evalbus::module::orchestrator::Submitter;
use evalbus::module::subscriber::Subscriber;
use options::{Command, LogFormat};
use structopt::StructOpt;
use tracing::info;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init()?;

    let success = match command {
        Command::Broker(options) => runner.run(Broker::new(options)).await,
        Command::Subscriber(options) => runner.run(Subscriber::new(options)).await,
        Command::Submit(options) => runner.run(Submitter::new(options)).await,
    };

    if !success {
        std::process::exit(1);
    }

    Ok(())
}

fn init() -> Result<(Command, ModuleRunner)> {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(options.log.as_str())
        .with_writer(std::io::stderr);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("evalbus {}", env!("CARGO_PKG_VERSION"));

    Ok((options.command, ModuleRunner::default()))
}
