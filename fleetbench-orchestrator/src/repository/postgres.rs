//! PostgreSQL Store
//!
//! Composes the `run` and `task` query functions into the atomic
//! operations of [`Store`]. Compound transitions run in one transaction
//! and take their locks on the run row first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetbench_core::domain::run::{Run, RunStatus};
use fleetbench_core::domain::task::{Provider, Task, TaskStatus};
use sqlx::PgPool;

use super::{
    ClaimSlot, NewRun, NewTask, Store, StoreResult, TaskUpdate, no_claims_message, run,
    task, timeout_message,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_run(
        &self,
        new_run: NewRun,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Task>)> {
        let mut tx = self.pool.begin().await?;

        let run = run::insert(&mut *tx, &new_run, now).await?;
        let mut created = Vec::with_capacity(tasks.len());
        for new_task in &tasks {
            created.push(task::insert(&mut *tx, run.id, new_task, now).await?);
        }

        tx.commit().await?;
        Ok((run, created))
    }

    async fn find_run(&self, id: &str) -> StoreResult<Option<Run>> {
        if let Some(run) = run::find_by_external_id(&self.pool, id).await? {
            return Ok(Some(run));
        }
        match id.parse::<i64>() {
            Ok(internal) => run::find_by_id(&self.pool, internal).await,
            Err(_) => Ok(None),
        }
    }

    async fn get_run(&self, run_id: i64) -> StoreResult<Option<Run>> {
        run::find_by_id(&self.pool, run_id).await
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        run::list_recent(&self.pool, limit).await
    }

    async fn list_running_runs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Run>> {
        run::list_running_created_before(&self.pool, cutoff).await
    }

    async fn list_tasks(&self, run_id: i64) -> StoreResult<Vec<Task>> {
        task::list_by_run(&self.pool, run_id).await
    }

    async fn list_tasks_with_status(
        &self,
        run_id: i64,
        status: TaskStatus,
    ) -> StoreResult<Vec<Task>> {
        task::list_by_run_and_status(&self.pool, run_id, status).await
    }

    async fn count_tasks_by_status(
        &self,
        run_id: i64,
    ) -> StoreResult<BTreeMap<TaskStatus, i64>> {
        task::count_by_status(&self.pool, run_id).await
    }

    async fn find_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        task::find_by_id(&self.pool, task_id).await
    }

    async fn claim_next_task(
        &self,
        run_id: i64,
        provider: Provider,
        instance_type: &str,
        runner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimSlot> {
        let mut tx = self.pool.begin().await?;

        // Shared lock: claimants run in parallel, cancel and stall-fail wait.
        match run::share_lock_status(&mut *tx, run_id).await? {
            Some(RunStatus::Running) => {}
            _ => return Ok(ClaimSlot::RunClosed),
        }

        let candidate = task::lock_next_pending(&mut *tx, run_id, provider, instance_type).await?;
        let slot = match candidate {
            Some(task_id) => {
                ClaimSlot::Claimed(task::mark_claimed(&mut *tx, task_id, runner_id, now).await?)
            }
            None if task::has_unresolved(&mut *tx, run_id, provider, instance_type).await? => {
                ClaimSlot::Busy
            }
            None => ClaimSlot::Exhausted,
        };

        tx.commit().await?;
        Ok(slot)
    }

    async fn update_claimed_task(
        &self,
        task_id: i64,
        runner_id: &str,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        task::apply_owned_update(&self.pool, task_id, runner_id, &update, now).await
    }

    async fn fail_stale_tasks(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let stale = task::lock_stale(&mut *tx, now - timeout).await?;
        let mut failed = Vec::with_capacity(stale.len());
        for t in stale {
            let message = timeout_message(t.heartbeat_at, timeout);
            failed.push(task::mark_failed(&mut *tx, t.id, "timeout", &message, now).await?);
        }

        tx.commit().await?;
        Ok(failed)
    }

    async fn cancel_run(
        &self,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Run, u64)>> {
        let mut tx = self.pool.begin().await?;

        match run::lock_by_id(&mut *tx, run_id).await? {
            Some(r) if r.is_running() => {}
            _ => return Ok(None),
        }

        let cancelled = task::cancel_unfinished(&mut *tx, run_id, now).await?;
        run::mark_finalize_requested(&mut *tx, run_id, now).await?;
        let run = run::update_status(&mut *tx, run_id, RunStatus::Cancelled, now).await?;

        tx.commit().await?;
        Ok(Some((run, cancelled)))
    }

    async fn fail_unclaimed_run(
        &self,
        run_id: i64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        match run::lock_by_id(&mut *tx, run_id).await? {
            Some(r) if r.is_running() && r.created_at < now - timeout => {}
            _ => return Ok(false),
        }

        let counts = task::count_by_status(&mut *tx, run_id).await?;
        let total: i64 = counts.values().sum();
        let pending = counts.get(&TaskStatus::Pending).copied().unwrap_or(0);
        if total == 0 || pending != total {
            return Ok(false);
        }

        let message = no_claims_message(timeout);
        task::fail_pending(&mut *tx, run_id, "no_claims", &message, now).await?;
        run::update_status(&mut *tx, run_id, RunStatus::Failed, now).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn request_finalization(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        run::request_finalization(&self.pool, run_id, now).await
    }

    async fn list_unfinished_finalizations(
        &self,
        requested_before: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        run::list_unfinished_finalizations(&self.pool, requested_before).await
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        archive_url: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        run::finalize(&self.pool, run_id, archive_url, now).await
    }
}
