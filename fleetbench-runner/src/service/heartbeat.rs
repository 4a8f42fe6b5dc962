//! Heartbeat reporter
//!
//! Keeps the latest progress of the running task and reports it to the
//! orchestrator on a fixed interval. Phase changes can also be pushed
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use fleetbench_client::OrchestratorClient;
use fleetbench_core::domain::task::HeartbeatPhase;
use fleetbench_core::dto::task::HeartbeatRequest;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

/// Latest known progress of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: HeartbeatPhase,
    pub message: Option<String>,
    pub current_benchmark: Option<String>,
    pub progress_pct: Option<i32>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: HeartbeatPhase::Running,
            message: None,
            current_benchmark: None,
            progress_pct: None,
        }
    }
}

/// Cheap handle the benchmark uses to publish progress
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Progress>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress::default());
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Record progress within the current benchmark
    pub fn benchmark(&self, name: &str, pct: i32, message: impl Into<String>) {
        let name = name.to_string();
        let message = message.into();
        self.tx.send_modify(|p| {
            p.phase = HeartbeatPhase::Running;
            p.current_benchmark = Some(name);
            p.progress_pct = Some(pct.clamp(0, 100));
            p.message = Some(message);
        });
    }

    /// Move to a new phase, keeping benchmark and percentage
    pub fn phase(&self, phase: HeartbeatPhase, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|p| {
            p.phase = phase;
            p.message = Some(message);
        });
    }

    pub fn snapshot(&self) -> Progress {
        self.tx.borrow().clone()
    }
}

/// Background heartbeat loop for one claimed task
pub struct Heartbeat {
    client: Arc<OrchestratorClient>,
    task_id: i64,
    runner_id: String,
    reporter: ProgressReporter,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start reporting every `interval`; the first report goes out immediately
    pub fn start(
        client: Arc<OrchestratorClient>,
        task_id: i64,
        runner_id: String,
        interval: Duration,
    ) -> Self {
        let (reporter, rx) = ProgressReporter::channel();
        let handle = tokio::spawn(Self::run_loop(
            Arc::clone(&client),
            task_id,
            runner_id.clone(),
            rx,
            interval,
        ));

        Self {
            client,
            task_id,
            runner_id,
            reporter,
            handle,
        }
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    /// Change phase and report it right away
    pub async fn send_now(&self, phase: HeartbeatPhase, message: &str) {
        self.reporter.phase(phase, message);
        send(
            &self.client,
            self.task_id,
            &self.runner_id,
            &self.reporter.snapshot(),
        )
        .await;
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    async fn run_loop(
        client: Arc<OrchestratorClient>,
        task_id: i64,
        runner_id: String,
        rx: watch::Receiver<Progress>,
        interval: Duration,
    ) {
        let mut ticker = time::interval(interval);

        loop {
            ticker.tick().await;

            let progress = rx.borrow().clone();
            send(&client, task_id, &runner_id, &progress).await;
        }
    }
}

/// Errors are logged only; a task the orchestrator stopped accepting will
/// be rejected again at completion time.
async fn send(client: &OrchestratorClient, task_id: i64, runner_id: &str, progress: &Progress) {
    debug!(
        "Heartbeat for task {}: {} {:?} {:?}",
        task_id, progress.phase, progress.current_benchmark, progress.progress_pct
    );

    if let Err(e) = client
        .heartbeat(task_id, &request(runner_id, progress))
        .await
    {
        warn!("Failed to send heartbeat for task {}: {}", task_id, e);
    }
}

fn request(runner_id: &str, progress: &Progress) -> HeartbeatRequest {
    HeartbeatRequest {
        runner_id: runner_id.to_string(),
        status: Some(progress.phase.to_string()),
        current_benchmark: progress.current_benchmark.clone(),
        progress_pct: progress.progress_pct,
        message: progress.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_tracks_latest_progress() {
        let (reporter, rx) = ProgressReporter::channel();
        assert_eq!(*rx.borrow(), Progress::default());

        reporter.benchmark("railsbench", 42, "Running railsbench (3/7)");
        reporter.phase(HeartbeatPhase::Uploading, "Uploading results");

        let latest = rx.borrow().clone();
        assert_eq!(latest.phase, HeartbeatPhase::Uploading);
        assert_eq!(latest.current_benchmark.as_deref(), Some("railsbench"));
        assert_eq!(latest.progress_pct, Some(42));
        assert_eq!(latest.message.as_deref(), Some("Uploading results"));
    }

    #[test]
    fn test_progress_is_clamped() {
        let (reporter, _rx) = ProgressReporter::channel();
        reporter.benchmark("x", 140, "");
        assert_eq!(reporter.snapshot().progress_pct, Some(100));
    }

    #[test]
    fn test_request_carries_snapshot() {
        let progress = Progress {
            phase: HeartbeatPhase::Error,
            message: Some("Benchmark execution failed".to_string()),
            current_benchmark: None,
            progress_pct: Some(10),
        };
        let req = request("runner-1", &progress);
        assert_eq!(req.runner_id, "runner-1");
        assert_eq!(req.status.as_deref(), Some("error"));
        assert_eq!(req.progress_pct, Some(10));
    }
}
