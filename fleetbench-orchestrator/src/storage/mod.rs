//! Storage Module
//!
//! Object storage boundary: presigned upload targets for runners and the
//! combined results archive built when a run is finalized.

pub mod archive;
pub mod s3;

use async_trait::async_trait;
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::task::PresignedUrls;

pub use s3::S3Storage;

/// Storage error type
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object storage request failed: {0}")]
    Request(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload targets for one task's result and error archives
    async fn presigned_upload_urls(
        &self,
        run_external_id: &str,
        task_id: i64,
    ) -> StorageResult<PresignedUrls>;

    /// Merge the result archives of `completed` into one archive and
    /// return its download URL
    async fn collect_all_results(&self, run: &Run, completed: &[Task]) -> StorageResult<String>;
}

pub fn result_key(run_external_id: &str, task_id: i64) -> String {
    format!("results/{run_external_id}/task_{task_id}_result.tar.gz")
}

pub fn error_key(run_external_id: &str, task_id: i64) -> String {
    format!("results/{run_external_id}/task_{task_id}_error.tar.gz")
}

pub fn combined_key(run_external_id: &str) -> String {
    format!("results/{run_external_id}/combined_results.tar.gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        assert_eq!(
            result_key("1736942400123", 7),
            "results/1736942400123/task_7_result.tar.gz"
        );
        assert_eq!(error_key("abc", 7), "results/abc/task_7_error.tar.gz");
        assert_eq!(combined_key("abc"), "results/abc/combined_results.tar.gz");
    }
}
