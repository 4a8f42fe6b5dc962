//! Fleetbench CLI
//!
//! Command-line interface for operating benchmark runs on the orchestrator.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "fleetbench")]
#[command(about = "Benchmark fleet orchestration CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "FLEETBENCH_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    /// API key for create and stop
    #[arg(long, env = "FLEETBENCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        orchestrator_url: cli.orchestrator_url,
        api_key: cli.api_key,
    };

    handle_command(cli.command, &config).await
}
