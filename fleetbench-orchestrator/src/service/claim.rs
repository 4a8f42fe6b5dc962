//! Claim Service
//!
//! Hands pending tasks to runners, one runner per task.

use chrono::Utc;
use fleetbench_core::domain::task::Provider;
use fleetbench_core::dto::task::{ClaimRequest, ClaimResponse, ClaimedTask};

use super::error::{EngineError, EngineResult};
use super::run::find_run;
use crate::repository::ClaimSlot;
use crate::state::AppState;

/// Claim the next pending task of `(provider, instance_type)` in a run
///
/// Answers `wait` while tasks of that pair are still in flight and `done`
/// once every one of them is resolved or the run stopped.
pub async fn claim_task(
    state: &AppState,
    run_id: &str,
    req: ClaimRequest,
) -> EngineResult<ClaimResponse> {
    let provider = required(&req.provider, "provider")?;
    let instance_type = required(&req.instance_type, "instance_type")?.trim();
    // Recorded exactly as sent; later updates compare against it verbatim
    let runner_id = required(&req.runner_id, "runner_id")?;
    let provider = provider
        .trim()
        .parse::<Provider>()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let run = find_run(state, run_id).await?;
    if !run.is_running() {
        return Ok(run_not_running());
    }

    let slot = state
        .store
        .claim_next_task(run.id, provider, instance_type, runner_id, Utc::now())
        .await?;

    let task = match slot {
        ClaimSlot::Claimed(task) => task,
        ClaimSlot::Busy => {
            return Ok(ClaimResponse::Wait {
                retry_after_seconds: state.settings.claim_retry_after_secs,
            });
        }
        ClaimSlot::Exhausted => return Ok(ClaimResponse::Done { message: None }),
        ClaimSlot::RunClosed => return Ok(run_not_running()),
    };

    tracing::info!(
        "Task {} of run {} claimed by {} ({}/{} #{})",
        task.id,
        run.external_id,
        runner_id,
        task.provider,
        task.instance_type,
        task.run_number
    );

    let presigned_urls = state
        .storage
        .presigned_upload_urls(&run.external_id, task.id)
        .await?;

    Ok(ClaimResponse::Assigned {
        task: ClaimedTask {
            id: task.id,
            run_id: run.external_id,
            ruby_version: run.ruby_version,
            provider: task.provider,
            instance_type: task.instance_type,
            instance_type_alias: task.instance_type_alias,
            run_number: task.run_number,
        },
        presigned_urls,
    })
}

fn run_not_running() -> ClaimResponse {
    ClaimResponse::Done {
        message: Some("Run is not running".to_string()),
    }
}

fn required<'a>(value: &'a str, name: &str) -> EngineResult<&'a str> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{name} is required")))
    } else {
        Ok(value)
    }
}
