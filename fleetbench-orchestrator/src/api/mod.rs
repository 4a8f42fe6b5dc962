//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Reads are public; anything that mutates a run or task needs the API key.

pub mod auth;
pub mod error;
pub mod health;
pub mod run;
pub mod task;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // Run endpoints
        .route("/runs", post(run::create_run))
        .route("/runs/{id}/stop", post(run::stop_run))
        // Runner endpoints
        .route("/runs/{id}/tasks/claim", post(task::claim_task))
        .route("/tasks/{id}/heartbeat", post(task::heartbeat))
        .route("/tasks/{id}/complete", post(task::complete))
        .route("/tasks/{id}/fail", post(task::fail))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Read-only run endpoints
        .route("/runs", get(run::list_runs))
        .route("/runs/{id}", get(run::get_run))
        .route("/runs/{id}/tasks", get(run::list_tasks))
        .merge(protected)
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
