//! Configuration module
//!
//! Handles CLI configuration: where the orchestrator lives and how to
//! authenticate against it.

use fleetbench_client::OrchestratorClient;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,

    /// Bearer token for mutating commands
    pub api_key: Option<String>,
}

impl Config {
    pub fn client(&self) -> OrchestratorClient {
        let client = OrchestratorClient::new(&self.orchestrator_url);
        match &self.api_key {
            Some(key) => client.with_api_key(key),
            None => client,
        }
    }
}
