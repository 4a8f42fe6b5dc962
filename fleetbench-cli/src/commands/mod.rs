//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod run;

pub use run::CreateArgs;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run
    Create(CreateArgs),
    /// Show a run with task counts by status
    Status {
        /// Run id
        id: String,
    },
    /// List recent runs
    List,
    /// List the tasks of a run
    Tasks {
        /// Run id
        id: String,
    },
    /// Stop a running run
    Stop {
        /// Run id
        id: String,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        Commands::Create(args) => run::create_run(&client, args).await,
        Commands::Status { id } => run::run_status(&client, &id).await,
        Commands::List => run::list_runs(&client).await,
        Commands::Tasks { id } => run::list_tasks(&client, &id).await,
        Commands::Stop { id } => run::stop_run(&client, &id).await,
    }
}
