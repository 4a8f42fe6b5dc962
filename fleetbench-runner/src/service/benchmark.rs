//! Benchmark execution service
//!
//! Runs the configured benchmark command for a claimed task inside the
//! task's work directory, captures its combined output and turns
//! ruby-bench progress lines into heartbeat progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetbench_core::dto::task::ClaimedTask;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::service::ProgressReporter;

/// Output file the command's stdout/stderr is captured to
pub const BENCHMARK_LOG: &str = "benchmark_output.txt";

/// Service trait for running one task's benchmark
#[async_trait]
pub trait BenchmarkService: Send + Sync {
    /// Run the benchmark for `task` with `work_dir` as output directory
    ///
    /// `Ok(false)` means the benchmark ran but failed; `Err` means it
    /// could not be started at all.
    async fn run(
        &self,
        task: &ClaimedTask,
        work_dir: &Path,
        progress: ProgressReporter,
    ) -> Result<bool>;
}

/// Runs a shell command through `sh -c`
pub struct ShellBenchmarkService {
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellBenchmarkService {
    pub fn new(command: String, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            working_dir,
        }
    }

    fn build_command(&self, task: &ClaimedTask, work_dir: &Path) -> Command {
        let mut cmd = Command::new("sh");
        // stderr is folded into stdout so progress lines arrive in order
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", self.command))
            .current_dir(self.working_dir.as_deref().unwrap_or(work_dir))
            .env("FLEETBENCH_TASK_ID", task.id.to_string())
            .env("FLEETBENCH_RUN_ID", &task.run_id)
            .env("FLEETBENCH_RUBY_VERSION", &task.ruby_version)
            .env("FLEETBENCH_PROVIDER", task.provider.as_str())
            .env("FLEETBENCH_INSTANCE_TYPE", &task.instance_type)
            .env("FLEETBENCH_RUN_NUMBER", task.run_number.to_string())
            .env("FLEETBENCH_WORK_DIR", work_dir)
            // Single-process Puma for consistent single-core numbers
            .env("WEB_CONCURRENCY", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BenchmarkService for ShellBenchmarkService {
    async fn run(
        &self,
        task: &ClaimedTask,
        work_dir: &Path,
        progress: ProgressReporter,
    ) -> Result<bool> {
        info!(
            "Running benchmark for task {} (Ruby {}, run {})",
            task.id, task.ruby_version, task.run_number
        );
        progress.benchmark("ruby_bench", 10, "Starting benchmarks");

        let log_path = work_dir.join(BENCHMARK_LOG);
        let mut log = fs::File::create(&log_path)
            .await
            .with_context(|| format!("Failed to create {}", log_path.display()))?;
        log.write_all(
            format!(
                "=== Benchmark Runner ===\nCommand: {}\nRuby Version: {}\nDate: {}\n\n=== Output ===\n",
                self.command,
                task.ruby_version,
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            )
            .as_bytes(),
        )
        .await?;

        let mut child = self
            .build_command(task, work_dir)
            .spawn()
            .context("Failed to spawn benchmark command")?;

        let stdout = child
            .stdout
            .take()
            .context("Benchmark stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
            debug!("{}", line);

            if let Some((name, current, total)) = parse_progress(&line) {
                progress.benchmark(
                    &name,
                    progress_pct(current, total),
                    format!("Running {name} ({current}/{total})"),
                );
            }
        }

        let status = child.wait().await.context("Failed to wait for benchmark")?;
        let footer = format!("\n=== Exit Status: {} ===\n", status.code().unwrap_or(-1));
        log.write_all(footer.as_bytes()).await?;
        log.flush().await?;

        if !status.success() {
            warn!("Benchmark for task {} exited with {}", task.id, status);
            return Ok(false);
        }

        progress.benchmark("ruby_bench", 90, "Collecting results");
        if !standardize_outputs(work_dir).await? {
            warn!("No benchmark output files found in {}", work_dir.display());
        }

        progress.benchmark("ruby_bench", 100, "Benchmark complete");
        Ok(true)
    }
}

/// Parse `Running benchmark "name" (X/Y)`
pub fn parse_progress(line: &str) -> Option<(String, u32, u32)> {
    let rest = line.split("Running benchmark \"").nth(1)?;
    let (name, rest) = rest.split_once('"')?;
    let counts = rest.trim_start().strip_prefix('(')?;
    let (counts, _) = counts.split_once(')')?;
    let (current, total) = counts.split_once('/')?;
    let current = current.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;
    (total > 0).then(|| (name.to_string(), current, total))
}

/// Benchmarks span 10% to 90% of the task
pub fn progress_pct(current: u32, total: u32) -> i32 {
    if total == 0 {
        return 10;
    }
    10 + ((current.min(total) as f64 / total as f64) * 80.0) as i32
}

/// Copy the first `output_NNN.{txt,json,csv}` set to `output.{txt,json,csv}`
///
/// Returns whether any output was found.
async fn standardize_outputs(work_dir: &Path) -> Result<bool> {
    let mut candidates = Vec::new();
    let mut entries = fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".txt").filter(|s| s.starts_with("output_")) {
            candidates.push(stem.to_string());
        }
    }
    candidates.sort();

    let Some(stem) = candidates.first() else {
        return Ok(work_dir.join("output.txt").exists());
    };

    for ext in ["txt", "json", "csv"] {
        let src = work_dir.join(format!("{stem}.{ext}"));
        if src.exists() {
            fs::copy(&src, work_dir.join(format!("output.{ext}"))).await?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_core::domain::task::Provider;

    fn task() -> ClaimedTask {
        ClaimedTask {
            id: 11,
            run_id: "1736942400123".to_string(),
            ruby_version: "3.4.1".to_string(),
            provider: Provider::Local,
            instance_type: "docker".to_string(),
            instance_type_alias: None,
            run_number: 2,
        }
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress(r#"Running benchmark "railsbench" (3/8)"#),
            Some(("railsbench".to_string(), 3, 8))
        );
        assert_eq!(
            parse_progress(r#"[info] Running benchmark "lobsters" ( 1/ 4) ..."#),
            Some(("lobsters".to_string(), 1, 4))
        );
        assert_eq!(parse_progress("Running benchmark railsbench"), None);
        assert_eq!(parse_progress(r#"Running benchmark "x" (1/0)"#), None);
    }

    #[test]
    fn test_progress_pct_range() {
        assert_eq!(progress_pct(0, 8), 10);
        assert_eq!(progress_pct(4, 8), 50);
        assert_eq!(progress_pct(8, 8), 90);
        assert_eq!(progress_pct(9, 8), 90);
    }

    #[tokio::test]
    async fn test_shell_command_output_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let service = ShellBenchmarkService::new(
            concat!(
                "echo 'Running benchmark \"fib\" (1/2)'; ",
                "echo oops >&2; ",
                "echo \"$FLEETBENCH_TASK_ID $FLEETBENCH_PROVIDER $FLEETBENCH_RUN_NUMBER\" > output_001.txt; ",
                "echo '{}' > output_001.json"
            )
            .to_string(),
            None,
        );
        let (reporter, rx) = ProgressReporter::channel();

        let ok = service.run(&task(), dir.path(), reporter).await.unwrap();
        assert!(ok);

        let output = std::fs::read_to_string(dir.path().join("output.txt")).unwrap();
        assert_eq!(output.trim(), "11 local 2");
        assert!(dir.path().join("output.json").exists());
        assert!(!dir.path().join("output.csv").exists());

        let log = std::fs::read_to_string(dir.path().join(BENCHMARK_LOG)).unwrap();
        assert!(log.contains("Running benchmark \"fib\" (1/2)"));
        assert!(log.contains("oops"));
        assert!(log.contains("=== Exit Status: 0 ==="));

        assert_eq!(rx.borrow().progress_pct, Some(100));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let service = ShellBenchmarkService::new("echo partial; exit 3".to_string(), None);
        let (reporter, rx) = ProgressReporter::channel();

        let ok = service.run(&task(), dir.path(), reporter).await.unwrap();
        assert!(!ok);

        let log = std::fs::read_to_string(dir.path().join(BENCHMARK_LOG)).unwrap();
        assert!(log.contains("partial"));
        assert!(log.contains("=== Exit Status: 3 ==="));
        assert_eq!(rx.borrow().progress_pct, Some(10));
    }
}
