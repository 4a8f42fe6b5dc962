//! Heartbeat Monitor
//!
//! Periodic sweep over in-flight work: fails tasks whose runner went
//! silent, fails runs nobody picked up, and re-enqueues finalizations that
//! were requested but never carried out.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::EngineResult;
use super::finalizer;
use crate::state::AppState;

/// What one sweep changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks failed for a stale heartbeat
    pub timed_out: usize,
    /// Runs failed because no task was ever claimed
    pub stalled: usize,
    /// Runs the sweep enqueued for collection after timeouts
    pub finalized: usize,
    /// Stale finalization requests enqueued again
    pub requeued: usize,
    /// Runs skipped this sweep because the store failed on them
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub async fn sweep(state: &AppState) -> EngineResult<SweepReport> {
    sweep_at(state, Utc::now()).await
}

/// Run one sweep as of `now`
pub async fn sweep_at(state: &AppState, now: DateTime<Utc>) -> EngineResult<SweepReport> {
    let settings = &state.settings;
    let mut report = SweepReport::default();

    let failed = state
        .store
        .fail_stale_tasks(settings.heartbeat_timeout, now)
        .await?;
    report.timed_out = failed.len();

    let mut runs = BTreeSet::new();
    for task in &failed {
        tracing::info!(
            "Task {} failed: no heartbeat since {:?} (runner {:?})",
            task.id,
            task.heartbeat_at,
            task.runner_id
        );
        runs.insert(task.run_id);
    }
    // One bad run must not hold up the rest of the sweep
    for run_id in runs {
        match finalizer::maybe_finalize(state, run_id).await {
            Ok(true) => report.finalized += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Finalization check for run {} failed: {}", run_id, e);
                report.errors += 1;
            }
        }
    }

    let overdue = state
        .store
        .list_running_runs_created_before(now - settings.no_claims_timeout)
        .await?;
    for run in overdue {
        let run_id = run.id;
        match finalizer::fail_if_unclaimed_at(state, run, now).await {
            Ok(after) if !after.is_running() => report.stalled += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Stall check for run {} failed: {}", run_id, e);
                report.errors += 1;
            }
        }
    }

    let unfinished = state
        .store
        .list_unfinished_finalizations(now - settings.finalize_retry)
        .await?;
    for run_id in unfinished {
        tracing::warn!("Finalization of run {} never completed, re-enqueueing", run_id);
        state.collector.enqueue(run_id);
        report.requeued += 1;
    }

    Ok(report)
}

/// Spawn the sweep loop, ticking every `interval` until `shutdown` fires
pub fn spawn(state: AppState, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Heartbeat monitor started (interval: {:?})", interval);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match sweep(&state).await {
                Ok(report) if !report.is_empty() => {
                    tracing::info!(
                        "Heartbeat sweep: {} timed out, {} stalled, {} finalized, {} requeued, {} errors",
                        report.timed_out,
                        report.stalled,
                        report.finalized,
                        report.requeued,
                        report.errors
                    );
                }
                Ok(_) => tracing::debug!("Heartbeat sweep: nothing to do"),
                Err(e) => tracing::error!("Heartbeat sweep failed: {}", e),
            }
        }

        tracing::info!("Heartbeat monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use fleetbench_core::domain::run::RunStatus;
    use fleetbench_core::domain::task::TaskStatus;

    use crate::repository::MemoryStore;
    use crate::testing::{FlakyStore, TestHarness, create_run};

    #[tokio::test]
    async fn test_stale_last_task_finalizes_run() {
        let mut harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 2).await;
        harness.claim_and_complete(&created, "c8g.medium", "r1").await;
        let stale = harness.claim(&created, "c8g.medium", "r2").await;
        assert!(harness.enqueued().is_empty());

        // Fresh heartbeats survive
        let report = sweep(&harness.state).await.unwrap();
        assert!(report.is_empty());

        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.finalized, 1);
        assert_eq!(harness.enqueued(), vec![created.run.id]);

        let task = harness.state.store.find_task(stale.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_type.as_deref(), Some("timeout"));
        assert!(task.error_message.unwrap().contains("Last heartbeat"));
    }

    #[tokio::test]
    async fn test_timeouts_in_one_run_enqueue_once() {
        let mut harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 3).await;
        for runner in ["r1", "r2", "r3"] {
            harness.claim(&created, "c8g.medium", runner).await;
        }

        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 3);
        assert_eq!(report.finalized, 1);
        assert_eq!(harness.enqueued(), vec![created.run.id]);
    }

    #[tokio::test]
    async fn test_sweep_fails_stalled_runs() {
        let harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 2).await;

        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(report.stalled, 1);

        let run = harness
            .state
            .store
            .get_run(created.run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_requeues_lost_finalizations() {
        let mut harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 1).await;
        harness.claim_and_complete(&created, "c8g.medium", "r1").await;
        assert_eq!(harness.enqueued(), vec![created.run.id]);

        // Collector never ran; past the retry window the sweep tries again
        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(harness.enqueued(), vec![created.run.id]);

        crate::service::collector::collect_run(&harness.state, created.run.id)
            .await
            .unwrap();
        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(6))
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_on_one_run_does_not_stop_sweep() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let mut harness = TestHarness::with_store(store.clone());
        harness.state.settings.finalize_retry = Duration::hours(1);
        let broken = create_run(&harness.state, &["c8g.medium"], 1).await;
        let healthy = create_run(&harness.state, &["c7i.large"], 1).await;
        let idle = create_run(&harness.state, &["c7g.large"], 1).await;
        harness.claim(&broken, "c8g.medium", "r1").await;
        harness.claim(&healthy, "c7i.large", "r2").await;
        store.fail_finalization_of(broken.run.id);

        let report = sweep_at(&harness.state, Utc::now() + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 2);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.stalled, 1);
        assert_eq!(harness.enqueued(), vec![healthy.run.id]);

        let idle = harness.state.store.get_run(idle.run.id).await.unwrap().unwrap();
        assert_eq!(idle.status, RunStatus::Failed);
    }
}
