//! Runner configuration
//!
//! Which run and instance type this runner serves, how to reach the
//! orchestrator, and how the benchmark command is executed.

use std::path::PathBuf;
use std::time::Duration;

use fleetbench_core::domain::task::Provider;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// Bearer token for the orchestrator API
    pub api_key: String,

    /// External id of the run to claim tasks from
    pub run_id: String,

    pub provider: String,

    pub instance_type: String,

    /// Unique identifier for this runner instance
    pub runner_id: String,

    /// Shell command that runs the benchmark suite
    pub benchmark_command: String,

    /// Directory the benchmark command runs in (defaults to the task's work dir)
    pub benchmark_dir: Option<PathBuf>,

    /// How often progress is reported while a task runs
    pub heartbeat_interval: Duration,

    /// Parent of the per-task work directories
    pub work_dir_base: PathBuf,

    /// Keep idling instead of exiting once the run has no more work
    pub no_exit: bool,

    /// Keep work directories after a task instead of removing them
    pub keep_work_dir: bool,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(
        orchestrator_url: String,
        run_id: String,
        provider: String,
        instance_type: String,
    ) -> Self {
        Self {
            orchestrator_url,
            api_key: String::new(),
            run_id,
            provider,
            instance_type,
            runner_id: default_runner_id(),
            benchmark_command: DEFAULT_BENCHMARK_COMMAND.to_string(),
            benchmark_dir: None,
            heartbeat_interval: Duration::from_secs(30),
            work_dir_base: std::env::temp_dir(),
            no_exit: false,
            keep_work_dir: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_URL (required)
    /// - API_KEY (required)
    /// - RUN_ID (required)
    /// - PROVIDER (required, aws|azure|local)
    /// - INSTANCE_TYPE (required)
    /// - RUNNER_ID (optional, default: <hostname>-<unix time>-<pid>)
    /// - BENCHMARK_COMMAND (optional, default: ruby-bench headline suite)
    /// - BENCHMARK_DIR (optional)
    /// - HEARTBEAT_INTERVAL_SECS (optional, default: 30)
    /// - WORK_DIR_BASE (optional, default: system temp dir)
    /// - NO_EXIT (optional, default: false)
    /// - KEEP_WORK_DIR (optional, default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .map_err(|_| anyhow::anyhow!("{name} environment variable not set"))
        };

        let mut config = Self::new(
            required("ORCHESTRATOR_URL")?,
            required("RUN_ID")?,
            required("PROVIDER")?,
            required("INSTANCE_TYPE")?,
        );
        config.api_key = required("API_KEY")?;

        if let Ok(runner_id) = std::env::var("RUNNER_ID") {
            config.runner_id = runner_id;
        }

        if let Ok(command) = std::env::var("BENCHMARK_COMMAND") {
            config.benchmark_command = command;
        }

        config.benchmark_dir = std::env::var("BENCHMARK_DIR").ok().map(PathBuf::from);

        if let Some(secs) = std::env::var("HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Ok(base) = std::env::var("WORK_DIR_BASE") {
            config.work_dir_base = PathBuf::from(base);
        }

        config.no_exit = env_flag("NO_EXIT");
        config.keep_work_dir = env_flag("KEEP_WORK_DIR");

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.orchestrator_url.is_empty() {
            anyhow::bail!("orchestrator_url cannot be empty");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.run_id.is_empty() {
            anyhow::bail!("run_id cannot be empty");
        }

        if self.provider.parse::<Provider>().is_err() {
            anyhow::bail!(
                "provider must be one of aws, azure, local (got '{}')",
                self.provider
            );
        }

        if self.instance_type.is_empty() {
            anyhow::bail!("instance_type cannot be empty");
        }

        if self.runner_id.is_empty() {
            anyhow::bail!("runner_id cannot be empty");
        }

        if self.benchmark_command.trim().is_empty() {
            anyhow::bail!("benchmark_command cannot be empty");
        }

        if self.heartbeat_interval.as_secs() == 0 {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        Ok(())
    }
}

const DEFAULT_BENCHMARK_COMMAND: &str =
    "./run_benchmarks.rb --headline --no-pinning --out-path \"$FLEETBENCH_WORK_DIR\" -e=\"yjit::$(command -v ruby)\"";

/// `<hostname>-<unix time>-<pid>`
fn default_runner_id() -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "runner".to_string());

    format!(
        "{}-{}-{}",
        hostname,
        chrono::Utc::now().timestamp(),
        std::process::id()
    )
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
