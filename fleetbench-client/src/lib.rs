//! Fleetbench HTTP Client
//!
//! A typed HTTP client for the fleetbench orchestrator API, shared by the
//! operator CLI and the benchmark runner.
//!
//! # Example
//!
//! ```no_run
//! use fleetbench_client::OrchestratorClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fleetbench_client::ClientError> {
//!     let client = OrchestratorClient::new("http://localhost:8080")
//!         .with_api_key("dev_api_key_change_in_production");
//!
//!     for run in client.list_runs().await? {
//!         println!("{} {}", run.external_id, run.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod runs;
mod tasks;
mod upload;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// HTTP client for the fleetbench orchestrator API
///
/// Endpoints are grouped by concern:
/// - Run management (create, list, status, tasks, stop)
/// - Task lifecycle for runners (claim, heartbeat, complete, fail)
/// - Artifact upload to presigned URLs
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// Bearer token sent with mutating requests
    api_key: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use fleetbench_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            client,
        }
    }

    /// Attach the API key required by mutating endpoints
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into()).filter(|k| !k.is_empty());
        self
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST with the bearer token when one is configured
    fn post(&self, path: &str) -> RequestBuilder {
        let builder = self.client.post(self.url(path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OrchestratorClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert!(client.api_key.is_none());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OrchestratorClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/runs"), "http://localhost:8080/runs");
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        let client = OrchestratorClient::new("http://localhost:8080").with_api_key("");
        assert!(client.api_key.is_none());
    }
}
