//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::run::{CreateRun, RunCreated, RunStatusReport, RunStopped};

impl OrchestratorClient {
    /// Create a run and its tasks
    ///
    /// # Example
    /// ```no_run
    /// # use fleetbench_client::OrchestratorClient;
    /// # use fleetbench_core::dto::run::{CreateRun, InstanceTypeSpec};
    /// # async fn example() -> fleetbench_client::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080").with_api_key("secret");
    /// let created = client.create_run(&CreateRun {
    ///     ruby_version: Some("3.4.1".to_string()),
    ///     tasks_per_instance_type: Some(3),
    ///     aws: vec![InstanceTypeSpec::Plain("c8g.medium".to_string())],
    ///     ..Default::default()
    /// }).await?;
    /// println!("{} tasks", created.tasks.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_run(&self, req: &CreateRun) -> Result<RunCreated> {
        let response = self.post("/runs").json(req).send().await?;

        self.handle_response(response).await
    }

    /// Most recent runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let response = self.get("/runs").send().await?;

        self.handle_response(response).await
    }

    /// Run state with task counts by status
    pub async fn get_run(&self, run_id: &str) -> Result<RunStatusReport> {
        let response = self.get(&format!("/runs/{run_id}")).send().await?;

        self.handle_response(response).await
    }

    /// Tasks of a run ordered by id
    pub async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>> {
        let response = self.get(&format!("/runs/{run_id}/tasks")).send().await?;

        self.handle_response(response).await
    }

    /// Cancel a running run
    pub async fn stop_run(&self, run_id: &str) -> Result<RunStopped> {
        let response = self.post(&format!("/runs/{run_id}/stop")).send().await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use crate::OrchestratorClient;
    use crate::test_server::respond_once;

    #[tokio::test]
    async fn test_stop_run_sends_bearer_token() {
        let (url, server) = respond_once("409 Conflict", r#"{"error":"Run r1 is not running"}"#).await;
        let client = OrchestratorClient::new(url).with_api_key("secret");

        let err = client.stop_run("r1").await.unwrap_err();
        assert!(err.is_conflict());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /runs/r1/stop "));
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_list_runs_parses_empty_list() {
        let (url, server) = respond_once("200 OK", "[]").await;
        let client = OrchestratorClient::new(url);

        let runs = client.list_runs().await.unwrap();
        assert!(runs.is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /runs "));
        assert!(!request.to_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let (url, _server) = respond_once("404 Not Found", r#"{"error":"Run not found"}"#).await;
        let client = OrchestratorClient::new(url);

        let err = client.get_run("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
