//! Fleetbench Runner
//!
//! A worker that serves one run and instance type on a benchmark machine.
//!
//! Architecture:
//! - Configuration: settings from the environment
//! - Services: benchmark execution, heartbeat reporting, artifact packaging
//! - Scheduler: claim loop and task lifecycle
//!
//! The runner claims tasks from the orchestrator, runs the benchmark
//! command for each, uploads the results to presigned storage URLs and
//! exits once the run has no more work.

mod config;
mod scheduler;
mod service;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::TaskWorker;
use crate::service::{BenchmarkService, ShellBenchmarkService};
use fleetbench_client::OrchestratorClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetbench_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fleetbench Runner");

    let config = Config::from_env()?;
    config.validate()?;

    info!("Orchestrator: {}", config.orchestrator_url);
    info!("Run ID: {}", config.run_id);
    info!("Provider: {}", config.provider);
    info!("Instance Type: {}", config.instance_type);
    info!("Runner ID: {}", config.runner_id);

    let client = Arc::new(
        OrchestratorClient::new(config.orchestrator_url.clone()).with_api_key(config.api_key.clone()),
    );

    let benchmark: Arc<dyn BenchmarkService> = Arc::new(ShellBenchmarkService::new(
        config.benchmark_command.clone(),
        config.benchmark_dir.clone(),
    ));

    let worker = TaskWorker::new(config, client, benchmark);

    if let Err(e) = worker.run().await {
        error!("Runner stopped: {:#}", e);
        return Err(e);
    }

    info!("Runner finished");
    Ok(())
}
