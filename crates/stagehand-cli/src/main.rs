mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, port } => commands::serve(bind, port, cli.in_memory).await,
        Command::Checkout { suite_runner_ids } => {
            commands::checkout(suite_runner_ids, cli.in_memory).await
        }
        Command::Release { testrun_id } => commands::release(testrun_id, cli.in_memory).await,
    }
}
