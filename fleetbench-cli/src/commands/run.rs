//! Run command handlers
//!
//! Create runs, inspect their progress and stop them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use fleetbench_client::OrchestratorClient;
use fleetbench_core::domain::run::{Run, RunStatus};
use fleetbench_core::domain::task::{Task, TaskStatus};
use fleetbench_core::dto::run::{CreateRun, InstanceTypeSpec, RunStatusReport};

/// Arguments for `create`
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Read the full request body from a JSON file instead
    #[arg(long, conflicts_with_all = ["ruby_version", "tasks", "aws", "azure", "local"])]
    pub file: Option<PathBuf>,

    /// Explicit run id (generated by the orchestrator when omitted)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Ruby version to benchmark
    #[arg(long)]
    pub ruby_version: Option<String>,

    /// Tasks per instance type
    #[arg(long, default_value_t = 1)]
    pub tasks: i32,

    /// AWS instance type, optionally `TYPE=ALIAS` (repeatable)
    #[arg(long, value_name = "TYPE[=ALIAS]")]
    pub aws: Vec<String>,

    /// Azure instance type, optionally `TYPE=ALIAS` (repeatable)
    #[arg(long, value_name = "TYPE[=ALIAS]")]
    pub azure: Vec<String>,

    /// Local instance type, optionally `TYPE=ALIAS` (repeatable)
    #[arg(long, value_name = "TYPE[=ALIAS]")]
    pub local: Vec<String>,
}

impl CreateArgs {
    /// Build the create request from flags or the JSON file
    pub fn to_request(&self) -> Result<CreateRun> {
        if let Some(path) = &self.file {
            let body = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut req: CreateRun = serde_json::from_str(&body)
                .with_context(|| format!("Invalid run request in {}", path.display()))?;
            if self.run_id.is_some() {
                req.run_id = self.run_id.clone();
            }
            return Ok(req);
        }

        Ok(CreateRun {
            run_id: self.run_id.clone(),
            ruby_version: self.ruby_version.clone(),
            tasks_per_instance_type: Some(self.tasks),
            per_instance_type: None,
            aws: self.aws.iter().map(|s| parse_instance_type(s)).collect(),
            azure: self.azure.iter().map(|s| parse_instance_type(s)).collect(),
            local: self.local.iter().map(|s| parse_instance_type(s)).collect(),
        })
    }
}

/// `c7i.large=intel` carries an alias; a bare type keeps the default
fn parse_instance_type(arg: &str) -> InstanceTypeSpec {
    match arg.split_once('=') {
        Some((instance_type, alias)) if !alias.is_empty() => InstanceTypeSpec::Detailed {
            instance_type: instance_type.to_string(),
            alias: Some(alias.to_string()),
        },
        Some((instance_type, _)) => InstanceTypeSpec::Plain(instance_type.to_string()),
        None => InstanceTypeSpec::Plain(arg.to_string()),
    }
}

/// Create a run and print its tasks
pub async fn create_run(client: &OrchestratorClient, args: CreateArgs) -> Result<()> {
    let req = args.to_request()?;
    let created = client.create_run(&req).await.context("Failed to create run")?;

    println!("{}", "✓ Run created".green().bold());
    println!("  ID:           {}", created.run.external_id.cyan());
    println!("  Ruby:         {}", created.run.ruby_version);
    println!("  Tasks:        {}", created.tasks.len());
    println!();
    for task in &created.tasks {
        print_task_summary(task);
    }

    Ok(())
}

/// Show a run with its task counts
pub async fn run_status(client: &OrchestratorClient, id: &str) -> Result<()> {
    let report = client.get_run(id).await?;
    print_run_report(&report);
    Ok(())
}

/// List recent runs
pub async fn list_runs(client: &OrchestratorClient) -> Result<()> {
    let runs = client.list_runs().await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

/// List the tasks of a run
pub async fn list_tasks(client: &OrchestratorClient, id: &str) -> Result<()> {
    let tasks = client.list_tasks(id).await?;

    if tasks.is_empty() {
        println!("{}", format!("No tasks found for run {}.", id).yellow());
    } else {
        println!(
            "{}",
            format!("Found {} task(s) for run {}:", tasks.len(), id).bold()
        );
        println!();
        for task in tasks {
            print_task_summary(&task);
        }
    }

    Ok(())
}

/// Cancel a running run
pub async fn stop_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let stopped = client.stop_run(id).await?;

    println!(
        "{} Run {} stopped ({} task(s) cancelled)",
        "✓".green(),
        stopped.run.external_id.cyan(),
        stopped.cancelled_tasks
    );

    Ok(())
}

fn print_run_summary(run: &Run) {
    println!("  {} Run {}", "▸".cyan(), run.external_id.bold());
    println!("    Status:   {}", colorize_run_status(run.status));
    println!("    Ruby:     {}", run.ruby_version);
    println!(
        "    Created:  {}",
        run.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_report(report: &RunStatusReport) {
    let run = &report.run;

    println!("{}", "Run Details:".bold());
    println!("  ID:          {}", run.external_id.cyan());
    println!("  Status:      {}", colorize_run_status(run.status));
    println!("  Ruby:        {}", run.ruby_version);
    println!("  Per type:    {}", run.tasks_per_instance_type);
    println!("  Created:     {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finalized) = run.finalized_at {
        println!("  Finalized:   {}", finalized.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(url) = &run.result_archive_url {
        println!("  Results:     {}", url.green());
    }

    println!("\n{}", format!("Tasks ({}):", report.total_tasks).bold());
    for (status, count) in &report.tasks_by_status {
        println!("  {:<10} {}", colorize_task_status(*status), count);
    }
}

fn print_task_summary(task: &Task) {
    println!(
        "  {} Task {} {}/{} #{}",
        "▸".cyan(),
        task.id.to_string().dimmed(),
        task.provider,
        task.instance_identifier(),
        task.run_number
    );
    println!("    Status:   {}", colorize_task_status(task.status));
    if let Some(runner) = &task.runner_id {
        println!("    Runner:   {}", runner.dimmed());
    }
    if let Some(phase) = task.heartbeat_status {
        let progress = task
            .progress_pct
            .map(|p| format!(" {p}%"))
            .unwrap_or_default();
        let benchmark = task.current_benchmark.as_deref().unwrap_or("-");
        println!("    Progress: {} {}{}", phase, benchmark, progress);
    }
    if let Some(error) = &task.error_message {
        let kind = task.error_type.as_deref().unwrap_or("error");
        println!("    Error:    {}", format!("{kind}: {error}").red());
    }
    println!();
}

/// Colorize run status for display
fn colorize_run_status(status: RunStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        RunStatus::Running => status_str.cyan(),
        RunStatus::Completed => status_str.green(),
        RunStatus::Cancelled => status_str.dimmed(),
        RunStatus::Failed => status_str.red(),
    }
}

/// Colorize task status for display
fn colorize_task_status(status: TaskStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        TaskStatus::Pending => status_str.yellow(),
        TaskStatus::Claimed | TaskStatus::Running => status_str.cyan(),
        TaskStatus::Completed => status_str.green(),
        TaskStatus::Failed => status_str.red(),
        TaskStatus::Cancelled => status_str.dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CreateArgs {
        CreateArgs {
            file: None,
            run_id: None,
            ruby_version: Some("3.4.1".to_string()),
            tasks: 3,
            aws: vec!["c8g.medium".to_string(), "c7i.large=intel".to_string()],
            azure: vec![],
            local: vec!["docker=".to_string()],
        }
    }

    #[test]
    fn test_parse_instance_type() {
        assert_eq!(
            parse_instance_type("c8g.medium"),
            InstanceTypeSpec::Plain("c8g.medium".to_string())
        );
        assert_eq!(
            parse_instance_type("c7i.large=intel"),
            InstanceTypeSpec::Detailed {
                instance_type: "c7i.large".to_string(),
                alias: Some("intel".to_string()),
            }
        );
        assert_eq!(
            parse_instance_type("docker="),
            InstanceTypeSpec::Plain("docker".to_string())
        );
    }

    #[test]
    fn test_request_from_flags() {
        let req = args().to_request().unwrap();
        assert_eq!(req.tasks_per_instance_type(), Some(3));
        assert_eq!(req.ruby_version.as_deref(), Some("3.4.1"));

        let types = req.instance_types();
        assert_eq!(types.len(), 3);
        assert_eq!(types[1].alias.as_deref(), Some("intel"));
        assert_eq!(types[2].instance_type, "docker");
    }

    #[test]
    fn test_request_from_file_keeps_run_id_override() {
        let path = std::env::temp_dir().join(format!("fleetbench-cli-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"ruby_version": "3.3.6", "per_instance_type": {"tasks": 2}, "azure": ["Standard_D2pls_v5"]}"#,
        )
        .unwrap();

        let args = CreateArgs {
            file: Some(path.clone()),
            run_id: Some("nightly-42".to_string()),
            ruby_version: None,
            tasks: 1,
            aws: vec![],
            azure: vec![],
            local: vec![],
        };
        let req = args.to_request().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(req.run_id.as_deref(), Some("nightly-42"));
        assert_eq!(req.tasks_per_instance_type(), Some(2));
        assert_eq!(req.instance_types().len(), 1);
    }
}
