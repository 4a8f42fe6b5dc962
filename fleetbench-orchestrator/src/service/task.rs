//! Task Service
//!
//! Runner-reported progress and outcomes for claimed tasks.

use chrono::Utc;
use fleetbench_core::domain::task::{HeartbeatPhase, Task};
use fleetbench_core::dto::task::{CompleteTaskRequest, FailTaskRequest, HeartbeatRequest};

use super::error::{EngineError, EngineResult};
use super::finalizer;
use crate::repository::{HeartbeatUpdate, TaskUpdate};
use crate::state::AppState;

/// Record a heartbeat from the runner that owns the task
pub async fn heartbeat(
    state: &AppState,
    task_id: i64,
    req: HeartbeatRequest,
) -> EngineResult<Task> {
    let phase = match req.status.as_deref().map(str::parse::<HeartbeatPhase>) {
        Some(Ok(phase)) => phase,
        Some(Err(e)) => return invalid(state, task_id, &req.runner_id, e.to_string()).await,
        None => return invalid(state, task_id, &req.runner_id, "status is required").await,
    };

    if let Some(pct) = req.progress_pct.filter(|p| !(0..=100).contains(p)) {
        let message = format!("progress_pct must be between 0 and 100, got {pct}");
        return invalid(state, task_id, &req.runner_id, message).await;
    }

    let update = TaskUpdate::Heartbeat(HeartbeatUpdate {
        phase,
        current_benchmark: req.current_benchmark,
        progress_pct: req.progress_pct,
        message: req.message,
    });

    let task = apply(state, task_id, &req.runner_id, update).await?;
    tracing::debug!(
        "Heartbeat for task {}: {} {:?} {:?}%",
        task.id,
        phase,
        task.current_benchmark,
        task.progress_pct
    );
    Ok(task)
}

/// Mark a task completed and check whether its run is done
pub async fn complete(
    state: &AppState,
    task_id: i64,
    req: CompleteTaskRequest,
) -> EngineResult<Task> {
    let Some(result_key) = req.result_key.filter(|k| !k.trim().is_empty()) else {
        return invalid(state, task_id, &req.runner_id, "result_key is required").await;
    };

    let task = apply(state, task_id, &req.runner_id, TaskUpdate::Complete { result_key }).await?;
    tracing::info!("Task {} completed by {}", task.id, req.runner_id);

    finalizer::maybe_finalize(state, task.run_id).await?;
    Ok(task)
}

/// Mark a task failed and check whether its run is done
pub async fn fail(state: &AppState, task_id: i64, req: FailTaskRequest) -> EngineResult<Task> {
    let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let (Some(error_type), Some(error_message)) =
        (present(req.error_type), present(req.error_message))
    else {
        return invalid(
            state,
            task_id,
            &req.runner_id,
            "error_type and error_message are required",
        )
        .await;
    };

    let update = TaskUpdate::Fail {
        error_type,
        error_message,
        error_key: present(req.error_key),
    };
    let task = apply(state, task_id, &req.runner_id, update).await?;
    tracing::warn!(
        "Task {} failed ({}): {}",
        task.id,
        task.error_type.as_deref().unwrap_or_default(),
        task.error_message.as_deref().unwrap_or_default()
    );

    finalizer::maybe_finalize(state, task.run_id).await?;
    Ok(task)
}

/// Reject a malformed update, after the task and its owner are resolved
///
/// Unknown tasks stay 404 and other runners stay 403 whatever they sent.
async fn invalid<T>(
    state: &AppState,
    task_id: i64,
    runner_id: &str,
    message: impl Into<String>,
) -> EngineResult<T> {
    let task = state
        .store
        .find_task(task_id)
        .await?
        .ok_or(EngineError::TaskNotFound(task_id))?;

    if !task.is_owned_by(runner_id) {
        return Err(EngineError::Forbidden("Invalid runner_id".to_string()));
    }

    Err(EngineError::Validation(message.into()))
}

/// Apply a guarded update, classifying a rejected one
async fn apply(
    state: &AppState,
    task_id: i64,
    runner_id: &str,
    update: TaskUpdate,
) -> EngineResult<Task> {
    if let Some(task) = state
        .store
        .update_claimed_task(task_id, runner_id, update, Utc::now())
        .await?
    {
        return Ok(task);
    }

    let task = state
        .store
        .find_task(task_id)
        .await?
        .ok_or(EngineError::TaskNotFound(task_id))?;

    if !task.is_owned_by(runner_id) {
        return Err(EngineError::Forbidden("Invalid runner_id".to_string()));
    }

    Err(EngineError::Conflict(format!(
        "Task {} is {} and no longer accepts updates",
        task.id, task.status
    )))
}
