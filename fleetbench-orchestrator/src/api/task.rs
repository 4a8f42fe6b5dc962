//! Task API Handlers
//!
//! Endpoints runners call to claim work and report on it.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use fleetbench_core::dto::task::{
    ClaimRequest, ClaimResponse, CompleteTaskRequest, FailTaskRequest, HeartbeatRequest, TaskAck,
};

use crate::api::error::ApiResult;
use crate::service::{claim, task as task_service};
use crate::state::AppState;

/// POST /runs/{run_id}/tasks/claim
pub async fn claim_task(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<Json<ClaimResponse>> {
    let Json(req) = payload?;
    tracing::debug!(
        "Claim request for run {} from {} ({}/{})",
        run_id,
        req.runner_id,
        req.provider,
        req.instance_type
    );

    let response = claim::claim_task(&state, &run_id, req).await?;
    Ok(Json(response))
}

/// POST /tasks/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<Json<TaskAck>> {
    let Json(req) = payload?;
    let task = task_service::heartbeat(&state, id, req).await?;
    Ok(Json(TaskAck { task }))
}

/// POST /tasks/{id}/complete
pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<CompleteTaskRequest>, JsonRejection>,
) -> ApiResult<Json<TaskAck>> {
    let Json(req) = payload?;
    let task = task_service::complete(&state, id, req).await?;
    Ok(Json(TaskAck { task }))
}

/// POST /tasks/{id}/fail
pub async fn fail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<FailTaskRequest>, JsonRejection>,
) -> ApiResult<Json<TaskAck>> {
    let Json(req) = payload?;
    let task = task_service::fail(&state, id, req).await?;
    Ok(Json(TaskAck { task }))
}
