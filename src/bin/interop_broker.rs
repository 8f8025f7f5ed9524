//! interop-broker: registry-driven call routing between desktop applications
//!
//! ## Usage
//! ```text
//! interop-broker start --metadata ./metadata --config broker.yaml
//! ```
//!
//! ## Configuration
//! ```yaml
//! metadata:
//!   dir: metadata
//!   file: interop.json
//!   reload_interval_ms: 1000
//!
//! bridge:
//!   event_sources:
//!     - service: interop.AppLauncherService
//!       method: AppLaunchedEventStream
//!   retry:
//!     mode: backoff
//!     max_times: 5
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use interop_broker::broker::BrokerRunner;
use interop_broker::config::Config;
use interop_broker::utils::bootstrap::{init_tracing, shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "interop-broker")]
#[command(about = "Interop broker routing calls between desktop applications")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker and block until Ctrl-C
    Start(StartArgs),
}

#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Metadata directory containing the registry document
    #[arg(short, long, value_name = "DIR")]
    metadata: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let Command::Start(start) = args.command.unwrap_or(Command::Start(StartArgs::default()));

    let mut config = Config::load(start.config.as_deref())?;
    if let Some(dir) = start.metadata {
        config.metadata.dir = dir;
    }

    info!(metadata = %config.metadata.path().display(), "Starting interop-broker");

    let runner = BrokerRunner::load(config).await?;
    runner.run_until(shutdown_signal()).await;

    Ok(())
}
