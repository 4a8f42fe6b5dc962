//! Task Repository
//!
//! Postgres queries for the `tasks` table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetbench_core::domain::task::{HeartbeatPhase, Provider, Task, TaskStatus};
use sqlx::postgres::PgExecutor;

use super::{NewTask, StoreError, StoreResult, TaskUpdate};

const TASK_COLUMNS: &str = "id, run_id, provider, instance_type, instance_type_alias, run_number, \
     status, runner_id, claimed_at, heartbeat_at, heartbeat_status, heartbeat_message, \
     current_benchmark, progress_pct, result_key, error_key, error_type, error_message, \
     created_at, updated_at";

/// Guard shared by every runner-initiated update: `$N` placeholders for
/// task id and runner id are appended by the caller.
const OWNED_AND_ACTIVE: &str = "status IN ('claimed', 'running') \
     AND EXISTS (SELECT 1 FROM runs WHERE runs.id = tasks.run_id AND runs.status = 'running')";

/// Insert a pending task for a run
pub async fn insert<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    task: &NewTask,
    now: DateTime<Utc>,
) -> StoreResult<Task> {
    let sql = format!(
        r#"
        INSERT INTO tasks (run_id, provider, instance_type, instance_type_alias, run_number, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING {TASK_COLUMNS}
        "#
    );

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(run_id)
        .bind(task.provider.as_str())
        .bind(&task.instance_type)
        .bind(&task.instance_type_alias)
        .bind(task.run_number)
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(|err| {
            let duplicate = err
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation());
            if duplicate {
                StoreError::DuplicateRunNumber {
                    provider: task.provider,
                    instance_type: task.instance_type.clone(),
                    run_number: task.run_number,
                }
            } else {
                StoreError::Database(err)
            }
        })?
        .try_into()
}

/// Find a task by ID
pub async fn find_by_id<'e>(executor: impl PgExecutor<'e>, id: i64) -> StoreResult<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(Task::try_from)
        .transpose()
}

/// List all tasks of a run ordered by id
pub async fn list_by_run<'e>(executor: impl PgExecutor<'e>, run_id: i64) -> StoreResult<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = $1 ORDER BY id");

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(run_id)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
}

/// List the tasks of a run in one status, ordered by id
pub async fn list_by_run_and_status<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    status: TaskStatus,
) -> StoreResult<Vec<Task>> {
    let sql =
        format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = $1 AND status = $2 ORDER BY id");

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(run_id)
        .bind(status.as_str())
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
}

/// Count the tasks of a run grouped by status
pub async fn count_by_status<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
) -> StoreResult<BTreeMap<TaskStatus, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE run_id = $1 GROUP BY status")
            .bind(run_id)
            .fetch_all(executor)
            .await?;

    rows.into_iter()
        .map(|(status, count)| {
            let status = status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("run {run_id}: {e}")))?;
            Ok((status, count))
        })
        .collect()
}

/// Lock the lowest-id pending task of a partition
///
/// Rows already locked by a concurrent claimant are skipped, so two
/// callers never wait on, or receive, the same task.
pub async fn lock_next_pending<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    provider: Provider,
    instance_type: &str,
) -> StoreResult<Option<i64>> {
    let id = sqlx::query_scalar(
        r#"
        SELECT id FROM tasks
        WHERE run_id = $1 AND provider = $2 AND instance_type = $3 AND status = 'pending'
        ORDER BY id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(run_id)
    .bind(provider.as_str())
    .bind(instance_type)
    .fetch_optional(executor)
    .await?;

    Ok(id)
}

/// Assign a locked pending task to a runner
pub async fn mark_claimed<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    runner_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<Task> {
    let sql = format!(
        r#"
        UPDATE tasks
        SET status = 'claimed', runner_id = $1, claimed_at = $2, heartbeat_at = $2, updated_at = $2
        WHERE id = $3
        RETURNING {TASK_COLUMNS}
        "#
    );

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(runner_id)
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await?
        .try_into()
}

/// Whether any task of a partition still needs work
///
/// Pending rows count too: a pending row locked by a concurrent claimant
/// is invisible to [`lock_next_pending`] but not resolved.
pub async fn has_unresolved<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    provider: Provider,
    instance_type: &str,
) -> StoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM tasks
            WHERE run_id = $1 AND provider = $2 AND instance_type = $3
              AND status IN ('pending', 'claimed', 'running')
        )
        "#,
    )
    .bind(run_id)
    .bind(provider.as_str())
    .bind(instance_type)
    .fetch_one(executor)
    .await?;

    Ok(exists)
}

/// Apply a runner update to a task the runner still owns
pub async fn apply_owned_update<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    runner_id: &str,
    update: &TaskUpdate,
    now: DateTime<Utc>,
) -> StoreResult<Option<Task>> {
    let row = match update {
        TaskUpdate::Heartbeat(hb) => {
            let sql = format!(
                r#"
                UPDATE tasks
                SET heartbeat_at = $1,
                    heartbeat_status = $2,
                    heartbeat_message = $3,
                    current_benchmark = COALESCE($4, current_benchmark),
                    progress_pct = COALESCE($5, progress_pct),
                    status = CASE WHEN $6 AND status = 'claimed' THEN 'running' ELSE status END,
                    updated_at = $1
                WHERE id = $7 AND runner_id = $8 AND {OWNED_AND_ACTIVE}
                RETURNING {TASK_COLUMNS}
                "#
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(now)
                .bind(hb.phase.as_str())
                .bind(&hb.message)
                .bind(&hb.current_benchmark)
                .bind(hb.progress_pct)
                .bind(hb.phase == HeartbeatPhase::Running)
                .bind(id)
                .bind(runner_id)
                .fetch_optional(executor)
                .await?
        }
        TaskUpdate::Complete { result_key } => {
            let sql = format!(
                r#"
                UPDATE tasks
                SET status = 'completed', result_key = $1, heartbeat_status = 'finished',
                    progress_pct = 100, updated_at = $2
                WHERE id = $3 AND runner_id = $4 AND {OWNED_AND_ACTIVE}
                RETURNING {TASK_COLUMNS}
                "#
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(result_key)
                .bind(now)
                .bind(id)
                .bind(runner_id)
                .fetch_optional(executor)
                .await?
        }
        TaskUpdate::Fail {
            error_type,
            error_message,
            error_key,
        } => {
            let sql = format!(
                r#"
                UPDATE tasks
                SET status = 'failed', error_type = $1, error_message = $2, error_key = $3,
                    heartbeat_status = 'error', updated_at = $4
                WHERE id = $5 AND runner_id = $6 AND {OWNED_AND_ACTIVE}
                RETURNING {TASK_COLUMNS}
                "#
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(error_type)
                .bind(error_message)
                .bind(error_key)
                .bind(now)
                .bind(id)
                .bind(runner_id)
                .fetch_optional(executor)
                .await?
        }
    };

    row.map(Task::try_from).transpose()
}

/// Lock claimed/running tasks whose last heartbeat is older than `cutoff`
pub async fn lock_stale<'e>(
    executor: impl PgExecutor<'e>,
    cutoff: DateTime<Utc>,
) -> StoreResult<Vec<Task>> {
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE status IN ('claimed', 'running') AND heartbeat_at < $1
        ORDER BY id
        FOR UPDATE SKIP LOCKED
        "#
    );

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(cutoff)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
}

/// Force a task into `failed`
pub async fn mark_failed<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    error_type: &str,
    error_message: &str,
    now: DateTime<Utc>,
) -> StoreResult<Task> {
    let sql = format!(
        r#"
        UPDATE tasks
        SET status = 'failed', error_type = $1, error_message = $2,
            heartbeat_status = 'error', updated_at = $3
        WHERE id = $4
        RETURNING {TASK_COLUMNS}
        "#
    );

    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(error_type)
        .bind(error_message)
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await?
        .try_into()
}

/// Cancel every unfinished task of a run
pub async fn cancel_unfinished<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'cancelled', updated_at = $1
        WHERE run_id = $2 AND status IN ('pending', 'claimed', 'running')
        "#,
    )
    .bind(now)
    .bind(run_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Fail every pending task of a run
pub async fn fail_pending<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
    error_type: &str,
    error_message: &str,
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'failed', error_type = $1, error_message = $2,
            heartbeat_status = 'error', updated_at = $3
        WHERE run_id = $4 AND status = 'pending'
        "#,
    )
    .bind(error_type)
    .bind(error_message)
    .bind(now)
    .bind(run_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    run_id: i64,
    provider: String,
    instance_type: String,
    instance_type_alias: Option<String>,
    run_number: i32,
    status: String,
    runner_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    heartbeat_status: Option<String>,
    heartbeat_message: Option<String>,
    current_benchmark: Option<String>,
    progress_pct: Option<i32>,
    result_key: Option<String>,
    error_key: Option<String>,
    error_type: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |e: fleetbench_core::domain::ParseEnumError| {
            StoreError::Corrupt(format!("task {}: {}", row.id, e))
        };

        let provider = row.provider.parse().map_err(corrupt)?;
        let status = row.status.parse().map_err(corrupt)?;
        let heartbeat_status = row
            .heartbeat_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(corrupt)?;

        Ok(Task {
            id: row.id,
            run_id: row.run_id,
            provider,
            instance_type: row.instance_type,
            instance_type_alias: row.instance_type_alias,
            run_number: row.run_number,
            status,
            runner_id: row.runner_id,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            heartbeat_status,
            heartbeat_message: row.heartbeat_message,
            current_benchmark: row.current_benchmark,
            progress_pct: row.progress_pct,
            result_key: row.result_key,
            error_key: row.error_key,
            error_type: row.error_type,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
