//! Download work units: probe, block fetch, finalize.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transfer_manager::client::BlobClient;
use crate::transfer_manager::error::TransferError;
use crate::transfer_manager::queue::{OperationOutput, TransferOperation};
use crate::transfer_manager::retry_policy::RetryPolicy;

/// The initial 1-byte probe discovering a blob's total size.
pub struct DownloadInitialOperation {
    unit_id: String,
    parent_id: String,
    url: String,
    client: Arc<BlobClient>,
    retry: RetryPolicy,
}

impl DownloadInitialOperation {
    pub fn new(
        unit_id: String,
        parent_id: String,
        url: String,
        client: Arc<BlobClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            unit_id,
            parent_id,
            url,
            client,
            retry,
        }
    }
}

#[async_trait]
impl TransferOperation for DownloadInitialOperation {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn parent_id(&self) -> Option<&str> {
        Some(&self.parent_id)
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<OperationOutput, TransferError> {
        let mut attempt = 0;
        let total_size = loop {
            match self.client.probe_size(&self.url).await {
                Ok(size) => break size,
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    debug!("Probe attempt {} failed, retrying: {}", attempt, e);
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(TransferError::Canceled),
                    }
                }
                Err(e) => return Err(e),
            }
        };

        Ok(OperationOutput {
            total_size: Some(total_size),
            bytes_transferred: 0,
        })
    }
}

/// Fetches one byte range and writes it at its own offset into the partial
/// file. Re-running overwrites the same offset, so the write is idempotent.
pub struct DownloadBlockOperation {
    unit_id: String,
    parent_id: String,
    url: String,
    start_range: u64,
    end_range: u64,
    partial_path: PathBuf,
    client: Arc<BlobClient>,
    retry: RetryPolicy,
}

impl DownloadBlockOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit_id: String,
        parent_id: String,
        url: String,
        start_range: u64,
        end_range: u64,
        partial_path: PathBuf,
        client: Arc<BlobClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            unit_id,
            parent_id,
            url,
            start_range,
            end_range,
            partial_path,
            client,
            retry,
        }
    }
}

#[async_trait]
impl TransferOperation for DownloadBlockOperation {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn parent_id(&self) -> Option<&str> {
        Some(&self.parent_id)
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<OperationOutput, TransferError> {
        let mut attempt = 0;
        let body = loop {
            match self
                .client
                .get_range(&self.url, self.start_range, self.end_range)
                .await
            {
                Ok(body) => break body,
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    debug!(
                        "Block {} attempt {} failed, retrying: {}",
                        self.unit_id, attempt, e
                    );
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(TransferError::Canceled),
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.partial_path)
            .await?;
        file.seek(SeekFrom::Start(self.start_range)).await?;
        file.write_all(&body).await?;
        file.flush().await?;

        Ok(OperationOutput {
            total_size: None,
            bytes_transferred: body.len() as u64,
        })
    }
}

/// Assembles the destination file once every block has landed: validates the
/// partial file's length and renames it onto the destination atomically.
pub struct DownloadFinalOperation {
    unit_id: String,
    parent_id: String,
    dependencies: Vec<String>,
    partial_path: PathBuf,
    destination: PathBuf,
    expected_len: u64,
}

impl DownloadFinalOperation {
    pub fn new(
        unit_id: String,
        parent_id: String,
        dependencies: Vec<String>,
        partial_path: PathBuf,
        destination: PathBuf,
        expected_len: u64,
    ) -> Self {
        Self {
            unit_id,
            parent_id,
            dependencies,
            partial_path,
            destination,
            expected_len,
        }
    }
}

#[async_trait]
impl TransferOperation for DownloadFinalOperation {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn parent_id(&self) -> Option<&str> {
        Some(&self.parent_id)
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<OperationOutput, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        // A zero-length blob has no block units; materialize the empty file.
        if self.expected_len == 0 {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&self.partial_path)
                .await?;
        }

        let actual_len = tokio::fs::metadata(&self.partial_path).await?.len();
        if actual_len != self.expected_len {
            return Err(TransferError::Transport {
                status: None,
                retryable: false,
                message: format!(
                    "assembled file is {} bytes, expected {}",
                    actual_len, self.expected_len
                ),
            });
        }

        if let Some(parent) = self.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::rename(&self.partial_path, &self.destination).await?;

        Ok(OperationOutput {
            total_size: None,
            bytes_transferred: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_final_renames_partial_onto_destination() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("out.bin.partial");
        let destination = dir.path().join("out.bin");
        tokio::fs::write(&partial, b"hello world").await.unwrap();

        let op = DownloadFinalOperation::new(
            "t-final".into(),
            "t".into(),
            vec![],
            partial.clone(),
            destination.clone(),
            11,
        );
        op.execute(&CancellationToken::new()).await.unwrap();

        assert!(!partial.exists());
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_final_creates_empty_destination_for_zero_length_blob() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("empty.bin.partial");
        let destination = dir.path().join("empty.bin");

        let op = DownloadFinalOperation::new(
            "t-final".into(),
            "t".into(),
            vec![],
            partial,
            destination.clone(),
            0,
        );
        op.execute(&CancellationToken::new()).await.unwrap();

        assert_eq!(tokio::fs::read(&destination).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_final_rejects_short_partial_file() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("short.bin.partial");
        let destination = dir.path().join("short.bin");
        tokio::fs::write(&partial, b"abc").await.unwrap();

        let op = DownloadFinalOperation::new(
            "t-final".into(),
            "t".into(),
            vec![],
            partial,
            destination.clone(),
            100,
        );
        let result = op.execute(&CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(!destination.exists());
    }
}
