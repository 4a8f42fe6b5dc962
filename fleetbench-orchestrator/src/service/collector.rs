//! Result Collector
//!
//! Background worker that builds the combined results archive of a run and
//! records its final status. Fed through an in-process queue of run ids.

use chrono::Utc;
use fleetbench_core::domain::run::{Run, RunStatus};
use fleetbench_core::domain::task::TaskStatus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::EngineResult;
use crate::state::AppState;

/// Sending half of the collection queue
#[derive(Clone)]
pub struct CollectorQueue {
    tx: mpsc::UnboundedSender<i64>,
}

impl CollectorQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Schedule collection for a run
    pub fn enqueue(&self, run_id: i64) {
        if self.tx.send(run_id).is_err() {
            tracing::error!("Collector queue closed, run {} left for the monitor", run_id);
        } else {
            tracing::debug!("Queued result collection for run {}", run_id);
        }
    }
}

/// Spawn the worker draining `rx` until the queue closes or `shutdown` fires
pub fn spawn_worker(
    state: AppState,
    mut rx: mpsc::UnboundedReceiver<i64>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Result collector started");
        loop {
            let run_id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(run_id) => run_id,
                    None => break,
                },
            };

            if let Err(e) = collect_run(&state, run_id).await {
                tracing::error!("Result collection for run {} failed: {}", run_id, e);
            }
        }
        tracing::info!("Result collector stopped");
    })
}

/// Collect a run's results and finalize it
///
/// Returns the finalized run, or `None` when there was nothing to do (the
/// run is gone, failed, or was already finalized). A storage failure never
/// blocks finalization; the run just ends up without an archive URL.
pub async fn collect_run(state: &AppState, run_id: i64) -> EngineResult<Option<Run>> {
    let Some(run) = state.store.get_run(run_id).await? else {
        tracing::warn!("Collection requested for unknown run {}", run_id);
        return Ok(None);
    };

    let collectable = matches!(run.status, RunStatus::Running | RunStatus::Cancelled);
    if run.finalized_at.is_some() || !collectable {
        tracing::debug!(
            "Run {} already {}, skipping collection",
            run.external_id,
            run.status
        );
        return Ok(None);
    }

    tracing::info!("Building results archive for run {}", run.external_id);

    let completed = state
        .store
        .list_tasks_with_status(run.id, TaskStatus::Completed)
        .await?;

    let archive_url = match state.storage.collect_all_results(&run, &completed).await {
        Ok(url) => {
            tracing::info!("Results archive for run {}: {}", run.external_id, url);
            Some(url)
        }
        Err(e) => {
            tracing::error!(
                "Failed to build results archive for run {}: {}",
                run.external_id,
                e
            );
            None
        }
    };

    let finalized = state
        .store
        .finalize_run(run.id, archive_url, Utc::now())
        .await?;

    if let Some(run) = &finalized {
        tracing::info!("Run {} finalized as {}", run.external_id, run.status);
    }

    Ok(finalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestHarness, create_run};

    #[tokio::test]
    async fn test_collect_completes_running_run_with_archive() {
        let harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 1).await;
        let run_id = created.run.id;

        let task = harness.claim_and_complete(&created, "c8g.medium", "r1").await;

        let run = collect_run(&harness.state, run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.result_archive_url.as_deref(),
            Some(format!("memory://{}/combined", created.run.external_id).as_str())
        );
        assert_eq!(harness.storage.collected(), vec![(run_id, vec![task.id])]);

        // Second delivery of the same job is a no-op
        assert!(collect_run(&harness.state, run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_still_finalizes() {
        let harness = TestHarness::new();
        harness.storage.fail_collection();
        let created = create_run(&harness.state, &["c8g.medium"], 1).await;
        harness.claim_and_complete(&created, "c8g.medium", "r1").await;

        let run = collect_run(&harness.state, created.run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.result_archive_url.is_none());
    }

    #[tokio::test]
    async fn test_worker_drains_queue_until_shutdown() {
        let harness = TestHarness::new();
        let created = create_run(&harness.state, &["c8g.medium"], 1).await;
        harness.claim_and_complete(&created, "c8g.medium", "r1").await;

        let (queue, rx) = CollectorQueue::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_worker(harness.state.clone(), rx, shutdown.clone());

        queue.enqueue(created.run.id);
        for _ in 0..50 {
            let run = harness.state.store.get_run(created.run.id).await.unwrap();
            if run.is_some_and(|r| r.finalized_at.is_some()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let run = harness
            .state
            .store
            .get_run(created.run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
