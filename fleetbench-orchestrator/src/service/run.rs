//! Run Service
//!
//! Business logic for creating, inspecting and stopping runs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::run::{CreateRun, RunCreated, RunStatusReport, RunStopped};
use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use super::finalizer;
use crate::repository::{NewRun, NewTask};
use crate::state::AppState;

/// How many runs the listing endpoint returns
pub const RUN_LIST_LIMIT: i64 = 100;

/// Create a run with `tasks_per_instance_type` pending tasks per
/// requested instance type
pub async fn create_run(state: &AppState, req: CreateRun) -> EngineResult<RunCreated> {
    let now = Utc::now();
    let (new_run, new_tasks) = plan_run(&req, now)?;

    let (run, tasks) = state.store.create_run(new_run, new_tasks, now).await?;

    tracing::info!(
        "Run created: {} (ruby {}, {} tasks)",
        run.external_id,
        run.ruby_version,
        tasks.len()
    );

    Ok(RunCreated { run, tasks })
}

/// Validate a create request and expand it into the rows to insert
fn plan_run(req: &CreateRun, now: DateTime<Utc>) -> EngineResult<(NewRun, Vec<NewTask>)> {
    let ruby_version = req
        .ruby_version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::Validation("ruby_version is required".to_string()))?;

    let tasks_per_instance_type = match req.tasks_per_instance_type() {
        Some(n) if n > 0 => n,
        Some(_) => {
            return Err(EngineError::Validation(
                "tasks_per_instance_type must be greater than 0".to_string(),
            ));
        }
        None => {
            return Err(EngineError::Validation(
                "tasks_per_instance_type is required".to_string(),
            ));
        }
    };

    let instance_types = req.instance_types();
    if instance_types.is_empty() {
        return Err(EngineError::Validation(
            "at least one instance type is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    for requested in instance_types {
        let instance_type = requested.instance_type.trim().to_string();
        if instance_type.is_empty() {
            return Err(EngineError::Validation(format!(
                "empty instance type for provider {}",
                requested.provider
            )));
        }
        if !seen.insert((requested.provider, instance_type.clone())) {
            return Err(EngineError::Validation(format!(
                "duplicate instance type {} for provider {}",
                instance_type, requested.provider
            )));
        }

        let alias = requested.alias.filter(|a| !a.trim().is_empty());
        tasks.extend((1..=tasks_per_instance_type).map(|run_number| NewTask {
            provider: requested.provider,
            instance_type: instance_type.clone(),
            instance_type_alias: alias.clone(),
            run_number,
        }));
    }

    let external_id = req
        .run_id
        .clone()
        .unwrap_or_else(|| generate_external_id(now));

    let run = NewRun {
        external_id,
        ruby_version: ruby_version.to_string(),
        tasks_per_instance_type,
    };

    Ok((run, tasks))
}

/// `<unix seconds><8 random digits>`
pub fn generate_external_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().as_u128() % 100_000_000;
    format!("{}{:08}", now.timestamp(), random)
}

/// Resolve a run by external or internal id, applying the stall check
pub async fn find_run(state: &AppState, id: &str) -> EngineResult<Run> {
    let run = state
        .store
        .find_run(id)
        .await?
        .ok_or_else(|| EngineError::RunNotFound(id.to_string()))?;

    finalizer::fail_if_unclaimed(state, run).await
}

/// Run with its task counts grouped by status
pub async fn get_run_status(state: &AppState, id: &str) -> EngineResult<RunStatusReport> {
    let run = find_run(state, id).await?;
    let counts = state.store.count_tasks_by_status(run.id).await?;
    Ok(RunStatusReport::new(run, counts))
}

/// Most recent runs, newest first
pub async fn list_runs(state: &AppState) -> EngineResult<Vec<Run>> {
    Ok(state.store.list_runs(RUN_LIST_LIMIT).await?)
}

/// Tasks of a run ordered by id
pub async fn list_tasks(state: &AppState, id: &str) -> EngineResult<Vec<Task>> {
    let run = find_run(state, id).await?;
    Ok(state.store.list_tasks(run.id).await?)
}

/// Stop a running run
pub async fn stop_run(state: &AppState, id: &str) -> EngineResult<RunStopped> {
    let run = state
        .store
        .find_run(id)
        .await?
        .ok_or_else(|| EngineError::RunNotFound(id.to_string()))?;

    finalizer::cancel(state, &run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_core::domain::run::RunStatus;
    use fleetbench_core::domain::task::{Provider, TaskStatus};
    use serde_json::json;

    use crate::testing::TestHarness;

    fn request(value: serde_json::Value) -> CreateRun {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_create_run_expands_tasks() {
        let harness = TestHarness::new();
        let created = create_run(
            &harness.state,
            request(json!({
                "ruby_version": "3.4.1",
                "tasks_per_instance_type": 2,
                "aws": ["c8g.medium"],
                "azure": [{"instance_type": "Standard_D2pls_v5", "alias": "arm"}]
            })),
        )
        .await
        .unwrap();

        assert_eq!(created.run.status, RunStatus::Running);
        assert_eq!(created.tasks.len(), 4);
        assert!(created.tasks.iter().all(|t| t.status == TaskStatus::Pending));

        let aws: Vec<_> = created
            .tasks
            .iter()
            .filter(|t| t.provider == Provider::Aws)
            .map(|t| t.run_number)
            .collect();
        assert_eq!(aws, vec![1, 2]);
        assert_eq!(created.tasks[0].instance_type_alias.as_deref(), Some("c8g.medium"));
        assert_eq!(created.tasks[2].instance_identifier(), "arm");
    }

    #[tokio::test]
    async fn test_create_run_validation() {
        let harness = TestHarness::new();
        let cases = [
            json!({"tasks_per_instance_type": 1, "aws": ["a"]}),
            json!({"ruby_version": " ", "tasks_per_instance_type": 1, "aws": ["a"]}),
            json!({"ruby_version": "3.4", "aws": ["a"]}),
            json!({"ruby_version": "3.4", "tasks_per_instance_type": 0, "aws": ["a"]}),
            json!({"ruby_version": "3.4", "tasks_per_instance_type": 1}),
            json!({"ruby_version": "3.4", "tasks_per_instance_type": 1, "aws": ["a", "a"]}),
            json!({"ruby_version": "3.4", "tasks_per_instance_type": 1, "local": [""]}),
        ];

        for case in cases {
            let err = create_run(&harness.state, request(case.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "{case}");
        }
        assert!(list_runs(&harness.state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_a_validation_error() {
        let harness = TestHarness::new();
        let body = json!({
            "run_id": "nightly-1",
            "ruby_version": "3.4.1",
            "tasks_per_instance_type": 1,
            "aws": ["c8g.medium"]
        });
        create_run(&harness.state, request(body.clone())).await.unwrap();

        let err = create_run(&harness.state, request(body)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg.contains("nightly-1")));
    }

    #[test]
    fn test_generated_external_id_shape() {
        let now = DateTime::from_timestamp(1_736_942_400, 0).unwrap();
        let id = generate_external_id(now);
        assert_eq!(id.len(), 18);
        assert!(id.starts_with("1736942400"));
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_status_report_and_lookup_by_internal_id() {
        let harness = TestHarness::new();
        let created = crate::testing::create_run(&harness.state, &["c8g.medium"], 3).await;
        harness.claim(&created, "c8g.medium", "r1").await;

        let report = get_run_status(&harness.state, &created.run.id.to_string())
            .await
            .unwrap();
        assert_eq!(report.run.external_id, created.run.external_id);
        assert_eq!(report.total_tasks, 3);
        assert_eq!(report.count(TaskStatus::Pending), 2);
        assert_eq!(report.count(TaskStatus::Claimed), 1);

        let err = get_run_status(&harness.state, "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_run() {
        let harness = TestHarness::new();
        let err = stop_run(&harness.state, "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }
}
