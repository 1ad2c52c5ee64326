//! Upload work units: block put and commit.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transfer_manager::client::BlobClient;
use crate::transfer_manager::error::TransferError;
use crate::transfer_manager::queue::{OperationOutput, TransferOperation};
use crate::transfer_manager::retry_policy::RetryPolicy;

/// Reads one byte range of the source file and stages it as a block.
/// The unit id doubles as the block id sent to the service.
pub struct UploadBlockOperation {
    unit_id: String,
    parent_id: String,
    url: String,
    source: PathBuf,
    start_range: u64,
    end_range: u64,
    client: Arc<BlobClient>,
    retry: RetryPolicy,
}

impl UploadBlockOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit_id: String,
        parent_id: String,
        url: String,
        source: PathBuf,
        start_range: u64,
        end_range: u64,
        client: Arc<BlobClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            unit_id,
            parent_id,
            url,
            source,
            start_range,
            end_range,
            client,
            retry,
        }
    }
}

#[async_trait]
impl TransferOperation for UploadBlockOperation {
    fn unit_id(&self) -> &str {
        &self.unit_id
    }

    fn parent_id(&self) -> Option<&str> {
        Some(&self.parent_id)
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<OperationOutput, TransferError> {
        let mut file = tokio::fs::File::open(&self.source).await?;
        file.seek(SeekFrom::Start(self.start_range)).await?;
        let mut buf = vec![0u8; (self.end_range - self.start_range) as usize];
        file.read_exact(&mut buf).await?;
        let body = Bytes::from(buf);

        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        let mut attempt = 0;
        loop {
            match self
                .client
                .put_block(&self.url, &self.unit_id, body.clone())
                .await
            {
                Ok(()) => break,
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
        }

        Ok(OperationOutput {
            total_size: None,
            bytes_transferred: body.len() as u64,
        })
    }
}

/// Commits the staged block list in decomposition order, assembling the
/// final blob on the service.
pub struct UploadFinalOperation {
    unit_id: String,
    parent_id: String,
    dependencies: Vec<String>,
    url: String,
    block_ids: Vec<String>,
    content_type: Option<String>,
    client: Arc<BlobClient>,
    retry: RetryPolicy,
}

impl UploadFinalOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit_id: String,
        parent_id: String,
        dependencies: Vec<String>,
        url: String,
        block_ids: Vec<String>,
        content_type: Option<String>,
        client: Arc<BlobClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            unit_id,
            parent_id,
            dependencies,
            url,
            block_ids,
            content_type,
            client,
            retry,
        }
    }
}

#[async_trait]
impl TransferOperation for UploadFinalOperation {
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

        let mut attempt = 0;
        loop {
            match self
                .client
                .commit_block_list(&self.url, &self.block_ids, self.content_type.as_deref())
                .await
            {
                Ok(()) => break,
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    debug!("Commit attempt {} failed, retrying: {}", attempt, e);
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(TransferError::Canceled),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(OperationOutput {
            total_size: None,
            bytes_transferred: 0,
        })
    }
}
