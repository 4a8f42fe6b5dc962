use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id BIGSERIAL PRIMARY KEY,
            external_id VARCHAR(255) NOT NULL UNIQUE,
            ruby_version VARCHAR(64) NOT NULL,
            tasks_per_instance_type INTEGER NOT NULL,
            status VARCHAR(32) NOT NULL,
            result_archive_url TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            finalize_requested_at TIMESTAMPTZ,
            finalized_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create tasks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id BIGSERIAL PRIMARY KEY,
            run_id BIGINT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            provider VARCHAR(32) NOT NULL,
            instance_type VARCHAR(255) NOT NULL,
            instance_type_alias VARCHAR(255),
            run_number INTEGER NOT NULL,
            status VARCHAR(32) NOT NULL,
            runner_id VARCHAR(255),
            claimed_at TIMESTAMPTZ,
            heartbeat_at TIMESTAMPTZ,
            heartbeat_status VARCHAR(32),
            heartbeat_message TEXT,
            current_benchmark VARCHAR(255),
            progress_pct INTEGER,
            result_key TEXT,
            error_key TEXT,
            error_type VARCHAR(64),
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the claim, monitor and listing queries
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(run_id, provider, instance_type, status, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_run_number \
         ON tasks(run_id, provider, instance_type, run_number)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_run_status ON tasks(run_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_heartbeat ON tasks(heartbeat_at) \
         WHERE status IN ('claimed', 'running')",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
