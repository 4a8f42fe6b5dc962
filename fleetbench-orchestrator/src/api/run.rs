//! Run API Handlers
//!
//! HTTP endpoints for creating, inspecting and stopping runs.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::run::{CreateRun, RunCreated, RunStatusReport, RunStopped};

use crate::api::error::ApiResult;
use crate::service::run as run_service;
use crate::state::AppState;

/// POST /runs
/// Create a run and its pending tasks
pub async fn create_run(
    State(state): State<AppState>,
    payload: Result<Json<CreateRun>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RunCreated>)> {
    let Json(req) = payload?;
    let created = run_service::create_run(&state, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /runs
/// Most recent runs, newest first
pub async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<Run>>> {
    tracing::debug!("Listing runs");

    let runs = run_service::list_runs(&state).await?;
    Ok(Json(runs))
}

/// GET /runs/{id}
/// Run with task counts by status
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunStatusReport>> {
    let report = run_service::get_run_status(&state, &id).await?;
    Ok(Json(report))
}

/// GET /runs/{id}/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = run_service::list_tasks(&state, &id).await?;
    Ok(Json(tasks))
}

/// POST /runs/{id}/stop
/// Cancel a running run
pub async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunStopped>> {
    tracing::info!("Stopping run: {}", id);

    let stopped = run_service::stop_run(&state, &id).await?;
    Ok(Json(stopped))
}
