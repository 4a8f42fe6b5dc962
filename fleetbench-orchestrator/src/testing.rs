//! Test fixtures: an [`AppState`] over [`MemoryStore`] with a recording
//! storage and an observable collector queue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::{Provider, Task, TaskStatus};
use fleetbench_core::dto::run::{CreateRun, InstanceTypeSpec, RunCreated};
use fleetbench_core::dto::task::{
    ClaimRequest, ClaimResponse, CompleteTaskRequest, FailTaskRequest, PresignedUrls,
};
use tokio::sync::mpsc;

use crate::repository::{
    ClaimSlot, MemoryStore, NewRun, NewTask, Store, StoreError, StoreResult, TaskUpdate,
};
use crate::service::collector::CollectorQueue;
use crate::service::{claim, run, task};
use crate::state::{AppState, EngineSettings};
use crate::storage::{Storage, StorageError, StorageResult, error_key, result_key};

#[derive(Default)]
pub struct RecordingStorage {
    collected: Mutex<Vec<(i64, Vec<i64>)>>,
    fail: AtomicBool,
}

impl RecordingStorage {
    /// `(run id, completed task ids)` per collection
    pub fn collected(&self) -> Vec<(i64, Vec<i64>)> {
        self.collected.lock().unwrap().clone()
    }

    pub fn fail_collection(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn presigned_upload_urls(
        &self,
        run_external_id: &str,
        task_id: i64,
    ) -> StorageResult<PresignedUrls> {
        let result_key = result_key(run_external_id, task_id);
        let error_key = error_key(run_external_id, task_id);
        Ok(PresignedUrls {
            result_upload_url: format!("memory://upload/{result_key}"),
            error_upload_url: format!("memory://upload/{error_key}"),
            result_key,
            error_key,
        })
    }

    async fn collect_all_results(&self, run: &Run, completed: &[Task]) -> StorageResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Request("bucket unreachable".to_string()));
        }
        self.collected
            .lock()
            .unwrap()
            .push((run.id, completed.iter().map(|t| t.id).collect()));
        Ok(format!("memory://{}/combined", run.external_id))
    }
}

/// [`MemoryStore`] that can be told to fail finalization requests of a run
pub struct FlakyStore {
    inner: MemoryStore,
    broken_run: Mutex<Option<i64>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            broken_run: Mutex::new(None),
        }
    }

    pub fn fail_finalization_of(&self, run_id: i64) {
        *self.broken_run.lock().unwrap() = Some(run_id);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_run(
        &self,
        run: NewRun,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Task>)> {
        self.inner.create_run(run, tasks, now).await
    }

    async fn find_run(&self, id: &str) -> StoreResult<Option<Run>> {
        self.inner.find_run(id).await
    }

    async fn get_run(&self, run_id: i64) -> StoreResult<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        self.inner.list_runs(limit).await
    }

    async fn list_running_runs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Run>> {
        self.inner.list_running_runs_created_before(cutoff).await
    }

    async fn list_tasks(&self, run_id: i64) -> StoreResult<Vec<Task>> {
        self.inner.list_tasks(run_id).await
    }

    async fn list_tasks_with_status(
        &self,
        run_id: i64,
        status: TaskStatus,
    ) -> StoreResult<Vec<Task>> {
        self.inner.list_tasks_with_status(run_id, status).await
    }

    async fn count_tasks_by_status(
        &self,
        run_id: i64,
    ) -> StoreResult<BTreeMap<TaskStatus, i64>> {
        self.inner.count_tasks_by_status(run_id).await
    }

    async fn find_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        self.inner.find_task(task_id).await
    }

    async fn claim_next_task(
        &self,
        run_id: i64,
        provider: Provider,
        instance_type: &str,
        runner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimSlot> {
        self.inner
            .claim_next_task(run_id, provider, instance_type, runner_id, now)
            .await
    }

    async fn update_claimed_task(
        &self,
        task_id: i64,
        runner_id: &str,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        self.inner
            .update_claimed_task(task_id, runner_id, update, now)
            .await
    }

    async fn fail_stale_tasks(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Task>> {
        self.inner.fail_stale_tasks(timeout, now).await
    }

    async fn cancel_run(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Run, u64)>> {
        self.inner.cancel_run(run_id, now).await
    }

    async fn fail_unclaimed_run(
        &self,
        run_id: i64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.fail_unclaimed_run(run_id, timeout, now).await
    }

    async fn request_finalization(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        if *self.broken_run.lock().unwrap() == Some(run_id) {
            return Err(StoreError::Corrupt(format!("run {run_id} is unreadable")));
        }
        self.inner.request_finalization(run_id, now).await
    }

    async fn list_unfinished_finalizations(
        &self,
        requested_before: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        self.inner.list_unfinished_finalizations(requested_before).await
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        archive_url: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        self.inner.finalize_run(run_id, archive_url, now).await
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub storage: Arc<RecordingStorage>,
    queue: mpsc::UnboundedReceiver<i64>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let storage = Arc::new(RecordingStorage::default());
        let (collector, queue) = CollectorQueue::new();
        let state = AppState::new(
            store,
            storage.clone(),
            collector,
            EngineSettings::default(),
        );
        Self {
            state,
            storage,
            queue,
        }
    }

    /// Run ids enqueued for collection since the last call
    pub fn enqueued(&mut self) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Ok(id) = self.queue.try_recv() {
            ids.push(id);
        }
        ids
    }

    pub async fn claim(&self, created: &RunCreated, instance_type: &str, runner_id: &str) -> Task {
        let response = claim::claim_task(
            &self.state,
            &created.run.external_id,
            claim_request(instance_type, runner_id),
        )
        .await
        .unwrap();
        let ClaimResponse::Assigned { task, .. } = response else {
            panic!("expected an assigned task, got {response:?}");
        };
        self.state.store.find_task(task.id).await.unwrap().unwrap()
    }

    pub async fn complete(&self, task_id: i64, runner_id: &str) -> Task {
        task::complete(
            &self.state,
            task_id,
            CompleteTaskRequest {
                runner_id: runner_id.to_string(),
                result_key: Some(format!("results/test/task_{task_id}_result.tar.gz")),
            },
        )
        .await
        .unwrap()
    }

    pub async fn fail(&self, task_id: i64, runner_id: &str, error_type: &str) -> Task {
        task::fail(
            &self.state,
            task_id,
            FailTaskRequest {
                runner_id: runner_id.to_string(),
                error_type: Some(error_type.to_string()),
                error_message: Some("benchmark exited with status 1".to_string()),
                error_key: None,
            },
        )
        .await
        .unwrap()
    }

    pub async fn claim_and_complete(
        &self,
        created: &RunCreated,
        instance_type: &str,
        runner_id: &str,
    ) -> Task {
        let claimed = self.claim(created, instance_type, runner_id).await;
        self.complete(claimed.id, runner_id).await
    }
}

/// Create a run on AWS with the given instance types
pub async fn create_run(state: &AppState, instance_types: &[&str], tasks: i32) -> RunCreated {
    let req = CreateRun {
        ruby_version: Some("3.4.1".to_string()),
        tasks_per_instance_type: Some(tasks),
        aws: instance_types
            .iter()
            .map(|t| InstanceTypeSpec::Plain(t.to_string()))
            .collect(),
        ..Default::default()
    };
    run::create_run(state, req).await.unwrap()
}

pub fn claim_request(instance_type: &str, runner_id: &str) -> ClaimRequest {
    ClaimRequest {
        provider: "aws".to_string(),
        instance_type: instance_type.to_string(),
        runner_id: runner_id.to_string(),
    }
}
