//! Repository Module
//!
//! Durable state for runs and tasks. The [`Store`] trait is the seam the
//! service layer talks to; every method is one atomic operation of the
//! backend, so compound transitions (claim, cancel, stall-fail,
//! finalization) never interleave with each other.

pub mod memory;
pub mod postgres;
pub mod run;
pub mod task;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::{HeartbeatPhase, Provider, Task, TaskStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Repository error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run id '{0}' is already taken")]
    DuplicateExternalId(String),

    #[error("run number {run_number} of {provider}/{instance_type} is already taken")]
    DuplicateRunNumber {
        provider: Provider,
        instance_type: String,
        run_number: i32,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Run to insert
#[derive(Debug, Clone)]
pub struct NewRun {
    pub external_id: String,
    pub ruby_version: String,
    pub tasks_per_instance_type: i32,
}

/// Task to insert alongside its run
#[derive(Debug, Clone)]
pub struct NewTask {
    pub provider: Provider,
    pub instance_type: String,
    pub instance_type_alias: Option<String>,
    pub run_number: i32,
}

/// Result of one claim attempt
#[derive(Debug, Clone)]
pub enum ClaimSlot {
    /// A pending task was handed to the caller
    Claimed(Task),
    /// Nothing claimable right now, but tasks of this type are unresolved
    Busy,
    /// Every task of this type is resolved
    Exhausted,
    /// The run is no longer running
    RunClosed,
}

/// Mutation a runner applies to a task it owns
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    Heartbeat(HeartbeatUpdate),
    Complete {
        result_key: String,
    },
    Fail {
        error_type: String,
        error_message: String,
        error_key: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct HeartbeatUpdate {
    pub phase: HeartbeatPhase,
    pub current_benchmark: Option<String>,
    pub progress_pct: Option<i32>,
    /// Replaces the stored message, clearing it when absent
    pub message: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a run with all of its tasks, or nothing at all
    async fn create_run(
        &self,
        run: NewRun,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> StoreResult<(Run, Vec<Task>)>;

    /// Find a run by external id, falling back to the internal id
    async fn find_run(&self, id: &str) -> StoreResult<Option<Run>>;

    async fn get_run(&self, run_id: i64) -> StoreResult<Option<Run>>;

    /// Most recent runs first
    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>>;

    async fn list_running_runs_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Run>>;

    /// Tasks of a run ordered by id
    async fn list_tasks(&self, run_id: i64) -> StoreResult<Vec<Task>>;

    async fn list_tasks_with_status(
        &self,
        run_id: i64,
        status: TaskStatus,
    ) -> StoreResult<Vec<Task>>;

    async fn count_tasks_by_status(&self, run_id: i64)
    -> StoreResult<BTreeMap<TaskStatus, i64>>;

    async fn find_task(&self, task_id: i64) -> StoreResult<Option<Task>>;

    /// Hand the lowest-id pending task of a partition to `runner_id`
    async fn claim_next_task(
        &self,
        run_id: i64,
        provider: Provider,
        instance_type: &str,
        runner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimSlot>;

    /// Apply `update` if `runner_id` owns the task, the task is claimed or
    /// running, and its run is running. Returns `None` when any guard fails.
    async fn update_claimed_task(
        &self,
        task_id: i64,
        runner_id: &str,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    /// Fail every claimed/running task silent for longer than `timeout`
    async fn fail_stale_tasks(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Task>>;

    /// Cancel a running run and its unfinished tasks, stamping the
    /// finalization request. Returns `None` if the run was not running.
    async fn cancel_run(&self, run_id: i64, now: DateTime<Utc>)
    -> StoreResult<Option<(Run, u64)>>;

    /// Fail a run older than `timeout` whose tasks are all still pending
    async fn fail_unclaimed_run(
        &self,
        run_id: i64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Stamp the finalization request of a running run with no unfinished
    /// tasks. Returns true only for the caller that stamped it.
    async fn request_finalization(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Runs whose finalization was requested before `requested_before` but
    /// never carried out
    async fn list_unfinished_finalizations(
        &self,
        requested_before: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>>;

    /// Move a run to its final status (cancelled stays cancelled, anything
    /// else becomes completed) and record the archive URL. Returns `None`
    /// if the run was already finalized or failed.
    async fn finalize_run(
        &self,
        run_id: i64,
        archive_url: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>>;
}

pub(crate) fn timeout_message(heartbeat_at: Option<DateTime<Utc>>, timeout: Duration) -> String {
    let last = heartbeat_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "No heartbeat received for {} seconds. Last heartbeat: {}",
        timeout.num_seconds(),
        last
    )
}

pub(crate) fn no_claims_message(timeout: Duration) -> String {
    format!("No tasks claimed within {} minutes", timeout.num_minutes())
}
