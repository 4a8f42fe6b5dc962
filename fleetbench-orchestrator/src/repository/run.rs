//! Run Repository
//!
//! Postgres queries for the `runs` table. Functions take any executor so
//! [`super::PgStore`] can run them on the pool or inside a transaction.

use chrono::{DateTime, Utc};
use fleetbench_core::domain::run::{Run, RunStatus};
use sqlx::postgres::PgExecutor;

use super::{NewRun, StoreError, StoreResult};

const RUN_COLUMNS: &str = "id, external_id, ruby_version, tasks_per_instance_type, status, \
     result_archive_url, created_at, updated_at, finalize_requested_at, finalized_at";

/// Insert a new run in `running` status
pub async fn insert<'e>(
    executor: impl PgExecutor<'e>,
    run: &NewRun,
    now: DateTime<Utc>,
) -> StoreResult<Run> {
    let sql = format!(
        r#"
        INSERT INTO runs (external_id, ruby_version, tasks_per_instance_type, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        RETURNING {RUN_COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(&run.external_id)
        .bind(&run.ruby_version)
        .bind(run.tasks_per_instance_type)
        .bind(RunStatus::Running.as_str())
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(|err| {
            let duplicate = err
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation());
            if duplicate {
                StoreError::DuplicateExternalId(run.external_id.clone())
            } else {
                StoreError::Database(err)
            }
        })?;

    row.try_into()
}

/// Find a run by its external id
pub async fn find_by_external_id<'e>(
    executor: impl PgExecutor<'e>,
    external_id: &str,
) -> StoreResult<Option<Run>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE external_id = $1");

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(external_id)
        .fetch_optional(executor)
        .await?
        .map(Run::try_from)
        .transpose()
}

/// Find a run by its internal id
pub async fn find_by_id<'e>(executor: impl PgExecutor<'e>, id: i64) -> StoreResult<Option<Run>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(Run::try_from)
        .transpose()
}

/// Find a run and hold an exclusive lock on its row until the transaction ends
pub async fn lock_by_id<'e>(executor: impl PgExecutor<'e>, id: i64) -> StoreResult<Option<Run>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE");

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(Run::try_from)
        .transpose()
}

/// Read a run's status under a shared lock
///
/// Blocks while a cancel or stall-fail holds the row, so claimants never
/// observe a run mid-transition.
pub async fn share_lock_status<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
) -> StoreResult<Option<RunStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM runs WHERE id = $1 FOR SHARE")
            .bind(id)
            .fetch_optional(executor)
            .await?;

    status
        .map(|s| s.parse().map_err(|e| StoreError::Corrupt(format!("{e}"))))
        .transpose()
}

/// List the most recent runs
pub async fn list_recent<'e>(executor: impl PgExecutor<'e>, limit: i64) -> StoreResult<Vec<Run>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, id DESC LIMIT $1");

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(limit)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Run::try_from)
        .collect()
}

/// List running runs created before `cutoff`
pub async fn list_running_created_before<'e>(
    executor: impl PgExecutor<'e>,
    cutoff: DateTime<Utc>,
) -> StoreResult<Vec<Run>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE status = $1 AND created_at < $2 ORDER BY id"
    );

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(RunStatus::Running.as_str())
        .bind(cutoff)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Run::try_from)
        .collect()
}

/// Set a run's status
pub async fn update_status<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    status: RunStatus,
    now: DateTime<Utc>,
) -> StoreResult<Run> {
    let sql = format!(
        "UPDATE runs SET status = $1, updated_at = $2 WHERE id = $3 RETURNING {RUN_COLUMNS}"
    );

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await?
        .try_into()
}

/// Stamp `finalize_requested_at` on a running run
pub async fn mark_finalize_requested<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE runs
        SET finalize_requested_at = COALESCE(finalize_requested_at, $1), updated_at = $1
        WHERE id = $2
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Stamp the finalization request if the run is running, unstamped, and
/// has no unfinished tasks
///
/// Concurrent callers serialize on the run row; the loser re-checks the
/// `finalize_requested_at IS NULL` predicate and matches nothing.
pub async fn request_finalization<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET finalize_requested_at = $1, updated_at = $1
        WHERE id = $2
          AND status = 'running'
          AND finalize_requested_at IS NULL
          AND NOT EXISTS (
              SELECT 1 FROM tasks
              WHERE tasks.run_id = runs.id
                AND tasks.status IN ('pending', 'claimed', 'running')
          )
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Ids of runs with a finalization request older than `requested_before`
/// that were never finalized
pub async fn list_unfinished_finalizations<'e>(
    executor: impl PgExecutor<'e>,
    requested_before: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM runs
        WHERE finalized_at IS NULL
          AND finalize_requested_at < $1
          AND status IN ('running', 'cancelled')
        ORDER BY id
        "#,
    )
    .bind(requested_before)
    .fetch_all(executor)
    .await?;

    Ok(ids)
}

/// Record the outcome of result collection, once
pub async fn finalize<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    archive_url: Option<String>,
    now: DateTime<Utc>,
) -> StoreResult<Option<Run>> {
    let sql = format!(
        r#"
        UPDATE runs
        SET status = CASE WHEN status = 'cancelled' THEN 'cancelled' ELSE 'completed' END,
            result_archive_url = $1,
            finalized_at = $2,
            updated_at = $2
        WHERE id = $3
          AND finalized_at IS NULL
          AND status IN ('running', 'cancelled')
        RETURNING {RUN_COLUMNS}
        "#
    );

    sqlx::query_as::<_, RunRow>(&sql)
        .bind(archive_url)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(Run::try_from)
        .transpose()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    external_id: String,
    ruby_version: String,
    tasks_per_instance_type: i32,
    status: String,
    result_archive_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finalize_requested_at: Option<DateTime<Utc>>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("run {}: {}", row.id, e)))?;

        Ok(Run {
            id: row.id,
            external_id: row.external_id,
            ruby_version: row.ruby_version,
            tasks_per_instance_type: row.tasks_per_instance_type,
            status,
            result_archive_url: row.result_archive_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finalize_requested_at: row.finalize_requested_at,
            finalized_at: row.finalized_at,
        })
    }
}
