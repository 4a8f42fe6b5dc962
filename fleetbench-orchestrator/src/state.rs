//! Shared application state

use std::sync::Arc;

use chrono::Duration;

use crate::config::Config;
use crate::repository::Store;
use crate::service::collector::CollectorQueue;
use crate::storage::Storage;

/// Everything handlers, the monitor and the collector worker share
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn Storage>,
    pub collector: CollectorQueue,
    pub settings: EngineSettings,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn Storage>,
        collector: CollectorQueue,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            storage,
            collector,
            settings,
        }
    }
}

/// Timeouts and hints the engine applies
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub api_key: String,
    pub heartbeat_timeout: Duration,
    pub no_claims_timeout: Duration,
    pub claim_retry_after_secs: u64,
    pub finalize_retry: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            heartbeat_timeout: to_chrono(config.heartbeat_timeout),
            no_claims_timeout: to_chrono(config.no_claims_timeout),
            claim_retry_after_secs: config.claim_retry_after.as_secs(),
            finalize_retry: to_chrono(config.finalize_retry),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365))
}
