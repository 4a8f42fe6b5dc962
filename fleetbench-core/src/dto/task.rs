//! Task DTOs exchanged between runners and the orchestrator

use serde::{Deserialize, Serialize};

use crate::domain::task::{Provider, Task};

/// Request from a runner for the next task of an instance type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub runner_id: String,
}

/// Outcome of a claim
///
/// `Wait` means unresolved tasks may still free up work; `Done` means no
/// more work will ever be handed out for the requested instance type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ClaimResponse {
    Assigned {
        task: ClaimedTask,
        presigned_urls: PresignedUrls,
    },
    Wait {
        retry_after_seconds: u64,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Everything a runner needs to execute a claimed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: i64,
    pub run_id: String,
    pub ruby_version: String,
    pub provider: Provider,
    pub instance_type: String,
    pub instance_type_alias: Option<String>,
    pub run_number: i32,
}

/// Upload targets for a task's result and error archives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrls {
    pub result_upload_url: String,
    pub error_upload_url: String,
    pub result_key: String,
    pub error_key: String,
}

/// Liveness and progress report for a claimed task
///
/// `status` is kept as sent and parsed into a
/// [`HeartbeatPhase`](crate::domain::task::HeartbeatPhase) by the
/// orchestrator once it knows who is asking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub runner_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_benchmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    #[serde(default)]
    pub runner_id: String,
    #[serde(default, alias = "s3_result_key")]
    pub result_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailTaskRequest {
    #[serde(default)]
    pub runner_id: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, alias = "s3_error_key", skip_serializing_if = "Option::is_none")]
    pub error_key: Option<String>,
}

/// Acknowledgement of a heartbeat, completion or failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAck {
    pub task: Task,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::HeartbeatPhase;
    use serde_json::json;

    #[test]
    fn test_claim_response_is_tagged_by_status() {
        let wait = serde_json::to_value(ClaimResponse::Wait {
            retry_after_seconds: 30,
        })
        .unwrap();
        assert_eq!(wait, json!({"status": "wait", "retry_after_seconds": 30}));

        let done = serde_json::to_value(ClaimResponse::Done { message: None }).unwrap();
        assert_eq!(done, json!({"status": "done"}));

        let parsed: ClaimResponse = serde_json::from_value(json!({
            "status": "done",
            "message": "Run is not running"
        }))
        .unwrap();
        assert!(matches!(parsed, ClaimResponse::Done { message: Some(m) } if m == "Run is not running"));
    }

    #[test]
    fn test_legacy_key_aliases() {
        let complete: CompleteTaskRequest = serde_json::from_value(json!({
            "runner_id": "r1",
            "s3_result_key": "results/1/task_1_result.tar.gz"
        }))
        .unwrap();
        assert_eq!(
            complete.result_key.as_deref(),
            Some("results/1/task_1_result.tar.gz")
        );

        let fail: FailTaskRequest = serde_json::from_value(json!({
            "runner_id": "r1",
            "error_type": "benchmark_failed",
            "error_message": "boom",
            "s3_error_key": "results/1/task_1_error.tar.gz"
        }))
        .unwrap();
        assert_eq!(fail.error_key.as_deref(), Some("results/1/task_1_error.tar.gz"));
    }

    #[test]
    fn test_heartbeat_status_is_kept_as_sent() {
        let hb: HeartbeatRequest = serde_json::from_value(json!({
            "runner_id": "r1",
            "status": "uploading",
            "progress_pct": 90
        }))
        .unwrap();
        assert_eq!(hb.status.as_deref(), Some("uploading"));
        assert_eq!(
            hb.status.as_deref().map(str::parse::<HeartbeatPhase>),
            Some(Ok(HeartbeatPhase::Uploading))
        );
        assert_eq!(hb.progress_pct, Some(90));
        assert!(hb.message.is_none());
    }
}
