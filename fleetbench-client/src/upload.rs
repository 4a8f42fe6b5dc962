//! Artifact upload to presigned object storage URLs

use std::path::Path;

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};

impl OrchestratorClient {
    /// PUT a local file to a presigned URL
    ///
    /// The URL carries its own signature, so no API key is attached.
    pub async fn upload_file(&self, presigned_url: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ClientError::UploadFailed {
            status: 0,
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let size = bytes.len();

        let response = self
            .client
            .put(presigned_url)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::UploadFailed {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!("Uploaded {} ({} bytes)", path.display(), size);
        Ok(())
    }
}
