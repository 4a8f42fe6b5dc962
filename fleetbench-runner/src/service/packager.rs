//! Artifact packaging
//!
//! Bundles a task's work directory with a `metadata.json` into a gzipped
//! tarball and ships it to its upload target.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetbench_client::OrchestratorClient;
use fleetbench_core::dto::task::ClaimedTask;
use serde::Serialize;
use tokio::fs;
use tokio::process::Command;
use tracing::info;

/// Which archive is being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Result,
    Error,
}

impl ArchiveKind {
    fn name(&self) -> &'static str {
        match self {
            ArchiveKind::Result => "result",
            ArchiveKind::Error => "error",
        }
    }

    fn status(&self) -> &'static str {
        match self {
            ArchiveKind::Result => "success",
            ArchiveKind::Error => "error",
        }
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub task_id: i64,
    pub provider: String,
    pub instance_type: String,
    pub ruby_version: String,
    pub run: i32,
    pub start_time: String,
    pub end_time: String,
    pub status: String,
    pub runner_id: String,
}

impl Metadata {
    pub fn new(
        task: &ClaimedTask,
        runner_id: &str,
        kind: ArchiveKind,
        start_time: &str,
        end_time: &str,
    ) -> Self {
        Self {
            task_id: task.id,
            provider: task.provider.to_string(),
            instance_type: task.instance_type.clone(),
            ruby_version: task.ruby_version.clone(),
            run: task.run_number,
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            status: kind.status().to_string(),
            runner_id: runner_id.to_string(),
        }
    }
}

/// Build `<work_dir>/<kind>.tar.gz`
///
/// Every regular file directly in `work_dir` is included (earlier archives
/// excepted), plus `metadata.json` and, for error archives, `error.txt`.
pub async fn package(
    work_dir: &Path,
    kind: ArchiveKind,
    metadata: &Metadata,
    error_message: Option<&str>,
) -> Result<PathBuf> {
    let staging = work_dir.join(kind.name());
    fs::create_dir_all(&staging)
        .await
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    copy_work_files(work_dir, &staging).await?;

    if let Some(message) = error_message {
        fs::write(staging.join("error.txt"), message).await?;
    }
    fs::write(
        staging.join("metadata.json"),
        serde_json::to_string_pretty(metadata)?,
    )
    .await?;

    let tarball = work_dir.join(format!("{}.tar.gz", kind.name()));
    let output = Command::new("tar")
        .arg("-czf")
        .arg(&tarball)
        .arg("-C")
        .arg(&staging)
        .arg(".")
        .output()
        .await
        .context("Failed to run tar")?;

    if !output.status.success() {
        anyhow::bail!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(tarball)
}

async fn copy_work_files(work_dir: &Path, dest: &Path) -> Result<()> {
    let mut entries = fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".tar.gz") {
            continue;
        }
        fs::copy(entry.path(), dest.join(&name)).await?;
    }
    Ok(())
}

/// Send an archive to its target
///
/// Absolute paths are treated as a shared local results directory;
/// anything else is a presigned URL.
pub async fn upload(client: &OrchestratorClient, file: &Path, target: &str) -> Result<()> {
    if target.starts_with('/') {
        let dest = Path::new(target);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(file, dest)
            .await
            .with_context(|| format!("Failed to copy archive to {target}"))?;
        info!("Copied {} to {}", file.display(), target);
        return Ok(());
    }

    client.upload_file(target, file).await?;
    info!("Uploaded {}", file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_core::domain::task::Provider;

    fn task() -> ClaimedTask {
        ClaimedTask {
            id: 5,
            run_id: "r1".to_string(),
            ruby_version: "3.4.1".to_string(),
            provider: Provider::Aws,
            instance_type: "c8g.medium".to_string(),
            instance_type_alias: Some("graviton".to_string()),
            run_number: 1,
        }
    }

    async fn list_archive(tarball: &Path) -> Vec<String> {
        let output = Command::new("tar").arg("-tzf").arg(tarball).output().await.unwrap();
        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim_start_matches("./").to_string())
            .filter(|l| !l.is_empty())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_metadata_json_shape() {
        let metadata = Metadata::new(
            &task(),
            "runner-1",
            ArchiveKind::Result,
            "2025-01-15T12:00:00Z",
            "2025-01-15T12:30:00Z",
        );
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["task_id"], 5);
        assert_eq!(value["provider"], "aws");
        assert_eq!(value["run"], 1);
        assert_eq!(value["status"], "success");
        assert_eq!(value["runner_id"], "runner-1");
    }

    #[tokio::test]
    async fn test_package_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), "fib 1.2s").unwrap();
        std::fs::write(dir.path().join("output.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("scratch")).unwrap();
        std::fs::write(dir.path().join("scratch/ignored.txt"), "x").unwrap();

        let metadata = Metadata::new(&task(), "runner-1", ArchiveKind::Result, "a", "b");
        let tarball = package(dir.path(), ArchiveKind::Result, &metadata, None)
            .await
            .unwrap();

        assert_eq!(tarball, dir.path().join("result.tar.gz"));
        assert_eq!(
            list_archive(&tarball).await,
            vec!["metadata.json", "output.json", "output.txt"]
        );
    }

    #[tokio::test]
    async fn test_package_error_after_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("benchmark_output.txt"), "boom").unwrap();

        let metadata = Metadata::new(&task(), "runner-1", ArchiveKind::Result, "a", "b");
        package(dir.path(), ArchiveKind::Result, &metadata, None)
            .await
            .unwrap();

        let metadata = Metadata::new(&task(), "runner-1", ArchiveKind::Error, "a", "b");
        let tarball = package(
            dir.path(),
            ArchiveKind::Error,
            &metadata,
            Some("Failed to upload results"),
        )
        .await
        .unwrap();

        assert_eq!(
            list_archive(&tarball).await,
            vec!["benchmark_output.txt", "error.txt", "metadata.json"]
        );
        let error = std::fs::read_to_string(dir.path().join("error/error.txt")).unwrap();
        assert_eq!(error, "Failed to upload results");
    }

    #[tokio::test]
    async fn test_upload_to_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("result.tar.gz");
        std::fs::write(&file, "tarball").unwrap();
        let target = dir.path().join("shared/results/r1/task_5_result.tar.gz");

        let client = OrchestratorClient::new("http://localhost:8080");
        upload(&client, &file, target.to_str().unwrap()).await.unwrap();

        assert_eq!(std::fs::read_to_string(target).unwrap(), "tarball");
    }
}
