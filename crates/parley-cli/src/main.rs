//! `parley` -- CLI entry point for the dialog orchestrator.
//!
//! Provides the three executable roles described by the process model:
//!
//! - `parley agent` -- run the agent loop (pipeline + workflow manager),
//!   fed by local channels and/or the broker's agent gateway.
//! - `parley service` -- run a service's broker gateway, batching
//!   `service_task`s into a registered [`parley_broker::ServiceCaller`].
//! - `parley channel` -- run a single channel front-end bridged to the
//!   broker.

use clap::{Parser, Subcommand};

mod commands;

/// parley dialog orchestrator CLI.
#[derive(Parser)]
#[command(name = "parley", about = "parley dialog orchestrator CLI", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands, one per process role.
#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop.
    Agent(commands::agent::AgentArgs),

    /// Run a service's broker gateway.
    Service(commands::service::ServiceArgs),

    /// Run a single channel front-end.
    Channel(commands::channel::ChannelArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Agent(args) => commands::agent::run(args).await?,
        Commands::Service(args) => commands::service::run(args).await?,
        Commands::Channel(args) => commands::channel::run(args).await?,
    }

    Ok(())
}
