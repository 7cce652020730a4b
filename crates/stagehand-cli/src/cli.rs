use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stagehand", about = "Environment provider for distributed test execution")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Use an in-memory store instead of etcd. Data does not survive the
    /// process; meant for local development and demos.
    #[arg(long, global = true)]
    pub in_memory: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the environment provider HTTP API.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
    },
    /// Run one checkout to completion and exit. Reads the request from the
    /// REQUEST cluster resource in orchestrated mode, or from the TERCC
    /// environment variable otherwise.
    Checkout {
        /// Suite runner ids to correlate sub-suites with (TERCC mode).
        #[arg(long = "suite-runner-id")]
        suite_runner_ids: Vec<String>,
    },
    /// Release every environment of a testrun.
    Release {
        testrun_id: String,
    },
}
