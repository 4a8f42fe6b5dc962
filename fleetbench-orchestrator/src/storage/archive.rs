//! Tarball helpers
//!
//! Thin wrappers over the system `tar` binary.

use std::path::Path;

use tokio::process::Command;

use super::{StorageError, StorageResult};

/// Files kept from each task's result archive
pub const RESULT_FILES: [&str; 4] = ["output.txt", "output.json", "output.csv", "metadata.json"];

/// Extract a `.tar.gz` into `dest`
pub async fn extract(tarball: &Path, dest: &Path) -> StorageResult<()> {
    tokio::fs::create_dir_all(dest).await?;
    run_tar(Command::new("tar").arg("-xzf").arg(tarball).arg("-C").arg(dest)).await
}

/// Pack the contents of `dir` into a `.tar.gz` at `output`
pub async fn create(dir: &Path, output: &Path) -> StorageResult<()> {
    run_tar(
        Command::new("tar")
            .arg("-czf")
            .arg(output)
            .arg("-C")
            .arg(dir)
            .arg("."),
    )
    .await
}

/// Copy the known result files present in `extracted` into `instance_dir`
///
/// Returns how many files were copied.
pub async fn copy_result_files(extracted: &Path, instance_dir: &Path) -> StorageResult<usize> {
    tokio::fs::create_dir_all(instance_dir).await?;

    let mut copied = 0;
    for name in RESULT_FILES {
        let source = extracted.join(name);
        if tokio::fs::try_exists(&source).await? {
            tokio::fs::copy(&source, instance_dir.join(name)).await?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn run_tar(command: &mut Command) -> StorageResult<()> {
    let output = command.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(StorageError::Archive(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_only_known_result_files() {
        let extracted = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::write(extracted.path().join("output.txt"), "ok").unwrap();
        std::fs::write(extracted.path().join("metadata.json"), "{}").unwrap();
        std::fs::write(extracted.path().join("scratch.log"), "noise").unwrap();

        let instance_dir = target.path().join("c8g.medium-1");
        let copied = copy_result_files(extracted.path(), &instance_dir)
            .await
            .unwrap();

        assert_eq!(copied, 2);
        assert!(instance_dir.join("output.txt").exists());
        assert!(instance_dir.join("metadata.json").exists());
        assert!(!instance_dir.join("scratch.log").exists());
    }

    #[tokio::test]
    async fn test_create_then_extract() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("output.txt"), "bench").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let tarball = scratch.path().join("result.tar.gz");
        create(source.path(), &tarball).await.unwrap();

        let dest = scratch.path().join("out");
        extract(&tarball, &dest).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("output.txt")).unwrap(),
            "bench"
        );
    }

    #[tokio::test]
    async fn test_extract_reports_tar_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let bogus = scratch.path().join("bogus.tar.gz");
        std::fs::write(&bogus, "not a tarball").unwrap();

        let err = extract(&bogus, &scratch.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Archive(_)));
    }
}
