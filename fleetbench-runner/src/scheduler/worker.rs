//! Task worker
//!
//! Claims tasks for one run and instance type until the orchestrator says
//! there is no more work. Each claimed task is benchmarked, packaged,
//! uploaded and reported as completed or failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use fleetbench_client::{ClientError, OrchestratorClient};
use fleetbench_core::domain::task::HeartbeatPhase;
use fleetbench_core::dto::task::{
    ClaimRequest, ClaimResponse, ClaimedTask, CompleteTaskRequest, FailTaskRequest, PresignedUrls,
};
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::service::packager::{self, ArchiveKind, Metadata};
use crate::service::{BenchmarkService, Heartbeat};

const CLAIM_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// How long to idle between claims once the run is done and `no_exit` is set
const IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Why a task did not complete
struct TaskFailure {
    error_type: &'static str,
    message: String,
}

impl TaskFailure {
    fn benchmark(message: impl Into<String>) -> Self {
        Self {
            error_type: "benchmark_failed",
            message: message.into(),
        }
    }

    fn upload(message: impl Into<String>) -> Self {
        Self {
            error_type: "upload_failed",
            message: message.into(),
        }
    }
}

/// Claim loop for a single runner
pub struct TaskWorker {
    config: Config,
    client: Arc<OrchestratorClient>,
    benchmark: Arc<dyn BenchmarkService>,
}

impl TaskWorker {
    pub fn new(
        config: Config,
        client: Arc<OrchestratorClient>,
        benchmark: Arc<dyn BenchmarkService>,
    ) -> Self {
        Self {
            config,
            client,
            benchmark,
        }
    }

    /// Run until the orchestrator reports `done`
    ///
    /// Fails when the orchestrator cannot be reached after retries or
    /// rejects the claim outright.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Worker starting (runner_id: {}, run_id: {})",
            self.config.runner_id, self.config.run_id
        );

        loop {
            info!("Claiming task...");

            match self.claim_with_retry().await? {
                ClaimResponse::Assigned {
                    task,
                    presigned_urls,
                } => {
                    self.process_task(task, presigned_urls).await;
                }
                ClaimResponse::Wait {
                    retry_after_seconds,
                } => {
                    info!("Waiting {} seconds for tasks...", retry_after_seconds);
                    time::sleep(Duration::from_secs(retry_after_seconds)).await;
                }
                ClaimResponse::Done { message } => {
                    let reason = message.as_deref().unwrap_or("no more tasks");
                    if !self.config.no_exit {
                        info!("Received 'done' ({}), shutting down", reason);
                        return Ok(());
                    }
                    info!("Received 'done' ({}), no-exit mode enabled. Waiting...", reason);
                    time::sleep(IDLE_INTERVAL).await;
                }
            }
        }
    }

    /// Claim with exponential backoff on transport and server errors
    ///
    /// Client errors (bad key, unknown run, invalid provider) are returned
    /// immediately since retrying cannot fix them.
    async fn claim_with_retry(&self) -> Result<ClaimResponse> {
        let req = ClaimRequest {
            provider: self.config.provider.clone(),
            instance_type: self.config.instance_type.clone(),
            runner_id: self.config.runner_id.clone(),
        };

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.client.claim_task(&self.config.run_id, &req).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_client_error() => {
                    return Err(anyhow::Error::new(e).context("Claim rejected by orchestrator"));
                }
                Err(e) if attempt >= CLAIM_ATTEMPTS => {
                    error!("Failed to claim task after {} attempts", CLAIM_ATTEMPTS);
                    return Err(anyhow::Error::new(e).context("Failed to claim task"));
                }
                Err(e) => {
                    warn!(
                        "Claim failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, CLAIM_ATTEMPTS, e, backoff
                    );
                    time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    /// Execute one task end to end; problems are reported, never returned
    async fn process_task(&self, task: ClaimedTask, urls: PresignedUrls) {
        info!(
            "Processing task {} (Ruby {}, run {})",
            task.id, task.ruby_version, task.run_number
        );

        let work_dir = self.work_dir(task.id);
        let start_time = timestamp();

        let heartbeat = Heartbeat::start(
            Arc::clone(&self.client),
            task.id,
            self.config.runner_id.clone(),
            self.config.heartbeat_interval,
        );

        let outcome = self
            .execute(&task, &urls, &work_dir, &start_time, &heartbeat)
            .await;

        match outcome {
            Ok(()) => {
                heartbeat.send_now(HeartbeatPhase::Finished, "Complete").await;
                let req = CompleteTaskRequest {
                    runner_id: self.config.runner_id.clone(),
                    result_key: Some(urls.result_key.clone()),
                };
                match self.client.complete_task(task.id, &req).await {
                    Ok(_) => info!("Completed task {} successfully", task.id),
                    Err(e) => report_rejection(task.id, "complete", &e),
                }
            }
            Err(failure) => {
                self.handle_failure(&task, &urls, &work_dir, &start_time, &heartbeat, failure)
                    .await;
            }
        }

        heartbeat.stop();

        if self.config.keep_work_dir {
            warn!("Keeping work directory: {}", work_dir.display());
        } else if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("Failed to remove {}: {}", work_dir.display(), e);
        }
    }

    async fn execute(
        &self,
        task: &ClaimedTask,
        urls: &PresignedUrls,
        work_dir: &Path,
        start_time: &str,
        heartbeat: &Heartbeat,
    ) -> std::result::Result<(), TaskFailure> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| TaskFailure::benchmark(format!("Failed to create work dir: {e}")))?;

        heartbeat
            .send_now(HeartbeatPhase::Running, "Starting benchmark")
            .await;

        match self.benchmark.run(task, work_dir, heartbeat.reporter()).await {
            Ok(true) => {}
            Ok(false) => return Err(TaskFailure::benchmark("Benchmark execution failed")),
            Err(e) => return Err(TaskFailure::benchmark(format!("{e:#}"))),
        }

        heartbeat
            .send_now(HeartbeatPhase::Uploading, "Uploading results")
            .await;

        let metadata = Metadata::new(
            task,
            &self.config.runner_id,
            ArchiveKind::Result,
            start_time,
            &timestamp(),
        );
        let tarball = packager::package(work_dir, ArchiveKind::Result, &metadata, None)
            .await
            .map_err(|e| TaskFailure::upload(format!("Failed to package results: {e:#}")))?;

        packager::upload(&self.client, &tarball, &urls.result_upload_url)
            .await
            .map_err(|e| {
                error!("Upload failed for task {}: {:#}", task.id, e);
                TaskFailure::upload("Failed to upload results")
            })
    }

    async fn handle_failure(
        &self,
        task: &ClaimedTask,
        urls: &PresignedUrls,
        work_dir: &Path,
        start_time: &str,
        heartbeat: &Heartbeat,
        failure: TaskFailure,
    ) {
        error!("Task {} failed: {}", task.id, failure.message);
        heartbeat
            .send_now(HeartbeatPhase::Error, &failure.message)
            .await;

        // The error archive is best effort; its key is only reported if it landed
        let error_key = match self
            .upload_error_archive(task, urls, work_dir, start_time, &failure.message)
            .await
        {
            Ok(()) => Some(urls.error_key.clone()),
            Err(e) => {
                warn!("Error archive for task {} not uploaded: {:#}", task.id, e);
                None
            }
        };

        let req = FailTaskRequest {
            runner_id: self.config.runner_id.clone(),
            error_type: Some(failure.error_type.to_string()),
            error_message: Some(failure.message),
            error_key,
        };
        if let Err(e) = self.client.fail_task(task.id, &req).await {
            report_rejection(task.id, "fail", &e);
        }
    }

    async fn upload_error_archive(
        &self,
        task: &ClaimedTask,
        urls: &PresignedUrls,
        work_dir: &Path,
        start_time: &str,
        message: &str,
    ) -> Result<()> {
        tokio::fs::create_dir_all(work_dir).await?;
        let metadata = Metadata::new(
            task,
            &self.config.runner_id,
            ArchiveKind::Error,
            start_time,
            &timestamp(),
        );
        let tarball = packager::package(work_dir, ArchiveKind::Error, &metadata, Some(message))
            .await
            .context("Failed to package error archive")?;
        packager::upload(&self.client, &tarball, &urls.error_upload_url).await
    }

    fn work_dir(&self, task_id: i64) -> PathBuf {
        self.config
            .work_dir_base
            .join(format!("fleetbench-task-{task_id}"))
    }
}

fn report_rejection(task_id: i64, action: &str, e: &ClientError) {
    if e.is_forbidden() || e.is_conflict() {
        warn!(
            "Orchestrator no longer accepts task {} ({} rejected): {}",
            task_id, action, e
        );
    } else {
        error!("Failed to {} task {}: {}", action, task_id, e);
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delays = vec![INITIAL_BACKOFF];
        for _ in 0..5 {
            let last = *delays.last().unwrap();
            delays.push(next_backoff(last));
        }
        let secs: Vec<u64> = delays.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_work_dir_per_task() {
        let mut config = Config::new(
            "http://localhost:8080".to_string(),
            "r1".to_string(),
            "aws".to_string(),
            "c8g.medium".to_string(),
        );
        config.work_dir_base = PathBuf::from("/var/tmp");

        struct NoBenchmark;

        #[async_trait::async_trait]
        impl BenchmarkService for NoBenchmark {
            async fn run(
                &self,
                _task: &ClaimedTask,
                _work_dir: &Path,
                _progress: crate::service::ProgressReporter,
            ) -> Result<bool> {
                Ok(true)
            }
        }

        let worker = TaskWorker::new(
            config,
            Arc::new(OrchestratorClient::new("http://localhost:8080")),
            Arc::new(NoBenchmark),
        );
        assert_eq!(
            worker.work_dir(42),
            PathBuf::from("/var/tmp/fleetbench-task-42")
        );
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }
}
