use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreBackend};
use crate::repository::{MemoryStore, PgStore, Store};
use crate::service::{collector, monitor};
use crate::state::{AppState, EngineSettings};
use crate::storage::S3Storage;

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod shutdown;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetbench_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Fleetbench Orchestrator...");

    let config = Config::from_env()?;
    config.validate()?;

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;
            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    tracing::info!("Using bucket {} in {}", config.s3.bucket, config.s3.region);
    let storage = Arc::new(S3Storage::connect(config.s3.clone()).await);

    let shutdown = shutdown::install_shutdown_handler()
        .context("Failed to install signal handlers")?;

    let (queue, queue_rx) = collector::CollectorQueue::new();
    let state = AppState::new(store, storage, queue, EngineSettings::from_config(&config));

    let collector_handle = collector::spawn_worker(state.clone(), queue_rx, shutdown.clone());
    let monitor_handle = monitor::spawn(state.clone(), config.monitor_interval, shutdown.clone());

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    // The server can also stop on its own; make sure the workers follow
    shutdown.cancel();
    let _ = tokio::join!(collector_handle, monitor_handle);

    tracing::info!("Orchestrator stopped");
    Ok(())
}
