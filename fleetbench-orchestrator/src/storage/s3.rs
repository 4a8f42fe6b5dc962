//! S3 Storage
//!
//! [`Storage`] over `aws-sdk-s3`. Works against AWS or any S3-compatible
//! endpoint (MinIO, LocalStack).

use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use fleetbench_core::domain::run::Run;
use fleetbench_core::domain::task::Task;
use fleetbench_core::dto::task::PresignedUrls;

use super::{Storage, StorageError, StorageResult, archive, combined_key, error_key, result_key};
use crate::config::S3Config;

pub struct S3Storage {
    client: S3Client,
    /// Client whose endpoint ends up in presigned upload URLs
    upload_client: S3Client,
    config: S3Config,
}

impl S3Storage {
    pub async fn connect(config: S3Config) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let build = |endpoint: Option<&str>| {
            let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
            if let Some(endpoint) = endpoint {
                builder = builder.endpoint_url(endpoint).force_path_style(true);
            }
            S3Client::from_conf(builder.build())
        };

        let client = build(config.endpoint.as_deref());
        let upload_client = build(
            config
                .upload_endpoint
                .as_deref()
                .or(config.endpoint.as_deref()),
        );

        tracing::info!(
            "S3 storage ready: bucket={} region={} endpoint={:?}",
            config.bucket,
            config.region,
            config.endpoint
        );

        Self {
            client,
            upload_client,
            config,
        }
    }

    async fn presign_put(&self, key: &str) -> StorageResult<String> {
        let presigning = PresigningConfig::expires_in(self.config.presign_expiry)
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let request = self
            .upload_client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Request(format!("presign {key}: {e}")))?;

        Ok(request.uri().to_string())
    }

    async fn download(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Request(format!("get {key}: {e}")))?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Request(format!("read {key}: {e}")))?
            .into_bytes();

        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn upload(&self, key: &str, source: &Path) -> StorageResult<()> {
        let body = tokio::fs::read(source).await?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Request(format!("put {key}: {e}")))?;

        Ok(())
    }

    /// Fetch and unpack one task's result archive into `combined`
    async fn gather_task(
        &self,
        task: &Task,
        key: &str,
        scratch: &Path,
        combined: &Path,
    ) -> StorageResult<usize> {
        let tarball = scratch.join(format!("task_{}_result.tar.gz", task.id));
        let extracted = scratch.join(format!("task_{}_extracted", task.id));

        self.download(key, &tarball).await?;
        archive::extract(&tarball, &extracted).await?;

        let instance_dir = combined.join(format!("{}-{}", task.instance_identifier(), task.id));
        archive::copy_result_files(&extracted, &instance_dir).await
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn presigned_upload_urls(
        &self,
        run_external_id: &str,
        task_id: i64,
    ) -> StorageResult<PresignedUrls> {
        let result_key = result_key(run_external_id, task_id);
        let error_key = error_key(run_external_id, task_id);

        Ok(PresignedUrls {
            result_upload_url: self.presign_put(&result_key).await?,
            error_upload_url: self.presign_put(&error_key).await?,
            result_key,
            error_key,
        })
    }

    async fn collect_all_results(&self, run: &Run, completed: &[Task]) -> StorageResult<String> {
        let scratch = tempfile::tempdir()?;
        let combined = scratch.path().join("combined");
        tokio::fs::create_dir_all(&combined).await?;

        for task in completed {
            let Some(key) = task.result_key.as_deref() else {
                continue;
            };
            match self.gather_task(task, key, scratch.path(), &combined).await {
                Ok(files) => {
                    tracing::debug!("Collected {} files from task {}", files, task.id);
                }
                Err(e) => {
                    tracing::warn!("Skipping results of task {}: {}", task.id, e);
                }
            }
        }

        let output = scratch.path().join("combined_results.tar.gz");
        archive::create(&combined, &output).await?;

        let key = combined_key(&run.external_id);
        self.upload(&key, &output).await?;

        Ok(public_url(&self.config, &key))
    }
}

/// Direct URL of an object in a publicly readable bucket
fn public_url(config: &S3Config, key: &str) -> String {
    match config.endpoint.as_deref() {
        Some(endpoint) => format!(
            "{}/{}/{}",
            endpoint.trim_end_matches('/'),
            config.bucket,
            key
        ),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, key
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn s3_config(endpoint: Option<&str>) -> S3Config {
        S3Config {
            bucket: "bench-results".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: endpoint.map(str::to_string),
            upload_endpoint: None,
            presign_expiry: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_public_url_for_aws() {
        assert_eq!(
            public_url(&s3_config(None), "results/1/combined_results.tar.gz"),
            "https://bench-results.s3.eu-west-1.amazonaws.com/results/1/combined_results.tar.gz"
        );
    }

    #[test]
    fn test_public_url_for_custom_endpoint() {
        assert_eq!(
            public_url(&s3_config(Some("http://localhost:9000/")), "results/1/x.tar.gz"),
            "http://localhost:9000/bench-results/results/1/x.tar.gz"
        );
    }
}
