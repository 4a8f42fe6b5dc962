//! In-memory store
//!
//! Everything lives behind one async mutex, so each [`Store`] method is
//! trivially atomic. Used for local development and the test suite.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetbench_core::domain::run::{Run, RunStatus};
use fleetbench_core::domain::task::{HeartbeatPhase, Provider, Task, TaskStatus};
use tokio::sync::Mutex;

use super::{
    ClaimSlot, NewRun, NewTask, Store, StoreError, StoreResult, TaskUpdate, no_claims_message,
    timeout_message,
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    runs: BTreeMap<i64, Run>,
    tasks: BTreeMap<i64, Task>,
    next_run_id: i64,
    next_task_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn tasks_of(&self, run_id: i64) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |t| t.run_id == run_id)
    }

    fn tasks_of_mut(&mut self, run_id: i64) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut().filter(move |t| t.run_id == run_id)
    }

    fn run_is_running(&self, run_id: i64) -> bool {
        self.runs.get(&run_id).is_some_and(Run::is_running)
    }

    fn set_run_status(&mut self, run_id: i64, status: RunStatus, now: DateTime<Utc>) -> Option<Run> {
        let run = self.runs.get_mut(&run_id)?;
        run.status = status;
        run.updated_at = now;
        Some(run.clone())
    }
}

fn fail_task(task: &mut Task, error_type: &str, error_message: String, now: DateTime<Utc>) {
    task.status = TaskStatus::Failed;
    task.error_type = Some(error_type.to_string());
    task.error_message = Some(error_message);
    task.heartbeat_status = Some(HeartbeatPhase::Error);
    task.updated_at = now;
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(
        &self,
        new_run: NewRun,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Task>)> {
        let mut state = self.state.lock().await;

        if state
            .runs
            .values()
            .any(|r| r.external_id == new_run.external_id)
        {
            return Err(StoreError::DuplicateExternalId(new_run.external_id));
        }

        let mut slots = BTreeSet::new();
        for t in &tasks {
            if !slots.insert((t.provider, t.instance_type.as_str(), t.run_number)) {
                return Err(StoreError::DuplicateRunNumber {
                    provider: t.provider,
                    instance_type: t.instance_type.clone(),
                    run_number: t.run_number,
                });
            }
        }

        state.next_run_id += 1;
        let run = Run {
            id: state.next_run_id,
            external_id: new_run.external_id,
            ruby_version: new_run.ruby_version,
            tasks_per_instance_type: new_run.tasks_per_instance_type,
            status: RunStatus::Running,
            result_archive_url: None,
            created_at: now,
            updated_at: now,
            finalize_requested_at: None,
            finalized_at: None,
        };
        state.runs.insert(run.id, run.clone());

        let mut created = Vec::with_capacity(tasks.len());
        for new_task in tasks {
            state.next_task_id += 1;
            let task = Task {
                id: state.next_task_id,
                run_id: run.id,
                provider: new_task.provider,
                instance_type: new_task.instance_type,
                instance_type_alias: new_task.instance_type_alias,
                run_number: new_task.run_number,
                status: TaskStatus::Pending,
                runner_id: None,
                claimed_at: None,
                heartbeat_at: None,
                heartbeat_status: None,
                heartbeat_message: None,
                current_benchmark: None,
                progress_pct: None,
                result_key: None,
                error_key: None,
                error_type: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            state.tasks.insert(task.id, task.clone());
            created.push(task);
        }

        Ok((run, created))
    }

    async fn find_run(&self, id: &str) -> StoreResult<Option<Run>> {
        let state = self.state.lock().await;
        let by_external = state.runs.values().find(|r| r.external_id == id);
        let found = by_external.or_else(|| {
            id.parse::<i64>()
                .ok()
                .and_then(|internal| state.runs.get(&internal))
        });
        Ok(found.cloned())
    }

    async fn get_run(&self, run_id: i64) -> StoreResult<Option<Run>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }

    async fn list_running_runs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Run>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.is_running() && r.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn list_tasks(&self, run_id: i64) -> StoreResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state.tasks_of(run_id).cloned().collect())
    }

    async fn list_tasks_with_status(
        &self,
        run_id: i64,
        status: TaskStatus,
    ) -> StoreResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks_of(run_id)
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn count_tasks_by_status(
        &self,
        run_id: i64,
    ) -> StoreResult<BTreeMap<TaskStatus, i64>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for task in state.tasks_of(run_id) {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn find_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn claim_next_task(
        &self,
        run_id: i64,
        provider: Provider,
        instance_type: &str,
        runner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimSlot> {
        let mut state = self.state.lock().await;

        if !state.run_is_running(run_id) {
            return Ok(ClaimSlot::RunClosed);
        }

        let mut unresolved = false;
        for task in state.tasks_of_mut(run_id) {
            if task.provider != provider || task.instance_type != instance_type {
                continue;
            }
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Claimed;
                task.runner_id = Some(runner_id.to_string());
                task.claimed_at = Some(now);
                task.heartbeat_at = Some(now);
                task.updated_at = now;
                return Ok(ClaimSlot::Claimed(task.clone()));
            }
            unresolved |= task.status.is_in_progress();
        }

        Ok(if unresolved {
            ClaimSlot::Busy
        } else {
            ClaimSlot::Exhausted
        })
    }

    async fn update_claimed_task(
        &self,
        task_id: i64,
        runner_id: &str,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut state = self.state.lock().await;

        let run_id = match state.tasks.get(&task_id) {
            Some(t) if t.is_owned_by(runner_id) && t.status.is_in_progress() => t.run_id,
            _ => return Ok(None),
        };
        if !state.run_is_running(run_id) {
            return Ok(None);
        }
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };

        match update {
            TaskUpdate::Heartbeat(hb) => {
                task.heartbeat_at = Some(now);
                task.heartbeat_status = Some(hb.phase);
                task.heartbeat_message = hb.message;
                if hb.current_benchmark.is_some() {
                    task.current_benchmark = hb.current_benchmark;
                }
                if hb.progress_pct.is_some() {
                    task.progress_pct = hb.progress_pct;
                }
                if hb.phase == HeartbeatPhase::Running && task.status == TaskStatus::Claimed {
                    task.status = TaskStatus::Running;
                }
            }
            TaskUpdate::Complete { result_key } => {
                task.status = TaskStatus::Completed;
                task.result_key = Some(result_key);
                task.heartbeat_status = Some(HeartbeatPhase::Finished);
                task.progress_pct = Some(100);
            }
            TaskUpdate::Fail {
                error_type,
                error_message,
                error_key,
            } => {
                task.error_key = error_key;
                fail_task(task, &error_type, error_message, now);
            }
        }
        task.updated_at = now;

        Ok(Some(task.clone()))
    }

    async fn fail_stale_tasks(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Task>> {
        let mut state = self.state.lock().await;
        let cutoff = now - timeout;

        let mut failed = Vec::new();
        for task in state.tasks.values_mut() {
            let stale = task.status.is_in_progress()
                && task.heartbeat_at.is_some_and(|at| at < cutoff);
            if stale {
                let message = timeout_message(task.heartbeat_at, timeout);
                fail_task(task, "timeout", message, now);
                failed.push(task.clone());
            }
        }
        Ok(failed)
    }

    async fn cancel_run(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Run, u64)>> {
        let mut state = self.state.lock().await;

        if !state.run_is_running(run_id) {
            return Ok(None);
        }

        let mut cancelled = 0;
        for task in state.tasks_of_mut(run_id) {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.updated_at = now;
                cancelled += 1;
            }
        }

        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        run.status = RunStatus::Cancelled;
        run.finalize_requested_at.get_or_insert(now);
        run.updated_at = now;

        Ok(Some((run.clone(), cancelled)))
    }

    async fn fail_unclaimed_run(
        &self,
        run_id: i64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;

        let overdue = state
            .runs
            .get(&run_id)
            .is_some_and(|r| r.is_running() && r.created_at < now - timeout);
        if !overdue {
            return Ok(false);
        }

        let all_pending = {
            let mut tasks = state.tasks_of(run_id).peekable();
            tasks.peek().is_some() && tasks.all(|t| t.status == TaskStatus::Pending)
        };
        if !all_pending {
            return Ok(false);
        }

        let message = no_claims_message(timeout);
        for task in state.tasks_of_mut(run_id) {
            fail_task(task, "no_claims", message.clone(), now);
        }
        state.set_run_status(run_id, RunStatus::Failed, now);

        Ok(true)
    }

    async fn request_finalization(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;

        let unfinished = state.tasks_of(run_id).any(|t| !t.status.is_terminal());
        match state.runs.get_mut(&run_id) {
            Some(run) if run.is_running() && run.finalize_requested_at.is_none() && !unfinished => {
                run.finalize_requested_at = Some(now);
                run.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unfinished_finalizations(
        &self,
        requested_before: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| {
                r.finalized_at.is_none()
                    && matches!(r.status, RunStatus::Running | RunStatus::Cancelled)
                    && r.finalize_requested_at.is_some_and(|at| at < requested_before)
            })
            .map(|r| r.id)
            .collect())
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        archive_url: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        let mut state = self.state.lock().await;

        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        if run.finalized_at.is_some()
            || !matches!(run.status, RunStatus::Running | RunStatus::Cancelled)
        {
            return Ok(None);
        }

        if run.status == RunStatus::Running {
            run.status = RunStatus::Completed;
        }
        run.result_archive_url = archive_url;
        run.finalized_at = Some(now);
        run.updated_at = now;

        Ok(Some(run.clone()))
    }
}
