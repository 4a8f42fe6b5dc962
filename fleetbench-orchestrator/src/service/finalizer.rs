//! Run Finalizer
//!
//! Decides when a run is done and hands it to the result collector.

use chrono::{DateTime, Utc};
use fleetbench_core::domain::run::Run;
use fleetbench_core::dto::run::RunStopped;

use super::error::{EngineError, EngineResult};
use crate::state::AppState;

/// Enqueue collection if the run is running and none of its tasks are
/// pending, claimed or running
///
/// Redundant and concurrent calls are safe: only the caller that stamps
/// the finalization request enqueues. Returns whether this call enqueued.
pub async fn maybe_finalize(state: &AppState, run_id: i64) -> EngineResult<bool> {
    let requested = state
        .store
        .request_finalization(run_id, Utc::now())
        .await?;

    if requested {
        tracing::info!("All tasks of run {} resolved, finalizing", run_id);
        state.collector.enqueue(run_id);
    }

    Ok(requested)
}

/// Cancel a running run and every unfinished task, then enqueue collection
pub async fn cancel(state: &AppState, run: &Run) -> EngineResult<RunStopped> {
    let (run, cancelled_tasks) = state
        .store
        .cancel_run(run.id, Utc::now())
        .await?
        .ok_or_else(|| {
            EngineError::Conflict(format!("Run {} is not running", run.external_id))
        })?;

    tracing::info!(
        "Run {} cancelled ({} tasks cancelled)",
        run.external_id,
        cancelled_tasks
    );
    state.collector.enqueue(run.id);

    Ok(RunStopped {
        run,
        cancelled_tasks,
    })
}

/// Fail a run nobody has claimed work from within the no-claims timeout
///
/// Returns the run as it is after the check.
pub async fn fail_if_unclaimed(state: &AppState, run: Run) -> EngineResult<Run> {
    fail_if_unclaimed_at(state, run, Utc::now()).await
}

pub async fn fail_if_unclaimed_at(
    state: &AppState,
    run: Run,
    now: DateTime<Utc>,
) -> EngineResult<Run> {
    let timeout = state.settings.no_claims_timeout;
    if !run.is_running() || run.created_at >= now - timeout {
        return Ok(run);
    }

    if !state.store.fail_unclaimed_run(run.id, timeout, now).await? {
        return Ok(run);
    }

    tracing::warn!(
        "Run {} failed: no tasks claimed within {} minutes",
        run.external_id,
        timeout.num_minutes()
    );

    Ok(state.store.get_run(run.id).await?.unwrap_or(run))
}
