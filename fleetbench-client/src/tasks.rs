//! Task lifecycle endpoints used by runners

use crate::OrchestratorClient;
use crate::error::Result;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::task::{
    ClaimRequest, ClaimResponse, CompleteTaskRequest, FailTaskRequest, HeartbeatRequest, TaskAck,
};

impl OrchestratorClient {
    /// Ask for the next task of an instance type in a run
    pub async fn claim_task(&self, run_id: &str, req: &ClaimRequest) -> Result<ClaimResponse> {
        let response = self
            .post(&format!("/runs/{run_id}/tasks/claim"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn heartbeat(&self, task_id: i64, req: &HeartbeatRequest) -> Result<Task> {
        let response = self
            .post(&format!("/tasks/{task_id}/heartbeat"))
            .json(req)
            .send()
            .await?;

        let ack: TaskAck = self.handle_response(response).await?;
        Ok(ack.task)
    }

    pub async fn complete_task(&self, task_id: i64, req: &CompleteTaskRequest) -> Result<Task> {
        let response = self
            .post(&format!("/tasks/{task_id}/complete"))
            .json(req)
            .send()
            .await?;

        let ack: TaskAck = self.handle_response(response).await?;
        Ok(ack.task)
    }

    pub async fn fail_task(&self, task_id: i64, req: &FailTaskRequest) -> Result<Task> {
        let response = self
            .post(&format!("/tasks/{task_id}/fail"))
            .json(req)
            .send()
            .await?;

        let ack: TaskAck = self.handle_response(response).await?;
        Ok(ack.task)
    }
}

#[cfg(test)]
mod tests {
    use fleetbench_core::dto::task::{ClaimRequest, ClaimResponse, HeartbeatRequest};

    use crate::OrchestratorClient;
    use crate::test_server::respond_once;

    #[tokio::test]
    async fn test_claim_wait_response() {
        let (url, server) =
            respond_once("200 OK", r#"{"status":"wait","retry_after_seconds":30}"#).await;
        let client = OrchestratorClient::new(url).with_api_key("secret");

        let req = ClaimRequest {
            provider: "aws".to_string(),
            instance_type: "c8g.medium".to_string(),
            runner_id: "runner-1".to_string(),
        };
        let response = client.claim_task("r1", &req).await.unwrap();
        assert!(matches!(
            response,
            ClaimResponse::Wait {
                retry_after_seconds: 30
            }
        ));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /runs/r1/tasks/claim "));
        assert!(request.contains(r#""runner_id":"runner-1""#));
    }

    #[tokio::test]
    async fn test_heartbeat_forbidden() {
        let (url, _server) = respond_once("403 Forbidden", r#"{"error":"Invalid runner_id"}"#).await;
        let client = OrchestratorClient::new(url).with_api_key("secret");

        let err = client
            .heartbeat(7, &HeartbeatRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_forbidden());
    }
}
