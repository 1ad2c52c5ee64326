//! HTTP client for the remote object-storage service.
//!
//! Thin wrapper over `reqwest` providing the four calls the transfer
//! protocols consume: size probe, range GET, block PUT, and the
//! commit-block-list POST. Authentication material is opaque to the engine;
//! a client is obtained per restoration id and carries whatever token it
//! was built with.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header;
use serde_json::json;

use super::error::TransferError;

/// Header carrying the stable session identifier, so the service can
/// correlate requests from the same installation across restarts.
pub const SESSION_HEADER: &str = "x-transfer-session";

/// Credentialed HTTP client for one object-storage endpoint.
pub struct BlobClient {
    client: reqwest::Client,
    session_id: String,
    bearer_token: Option<String>,
}

impl BlobClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `timeout` - Per-request timeout
    /// * `session_id` - Stable session identifier sent on every request
    pub fn new(timeout: Duration, session_id: String) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            session_id,
            bearer_token: None,
        })
    }

    /// Attach an opaque bearer token to every request.
    pub fn with_bearer_token(mut self, token: String) -> Self {
        self.bearer_token = Some(token);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(SESSION_HEADER, &self.session_id);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Discover the total size of a blob with a 1-byte range request.
    ///
    /// A 206 reports the size in `Content-Range`; a 416 with
    /// `bytes */<n>` is the zero-length-blob path; a plain 200 means the
    /// service ignored the range header and the body length is the size.
    pub async fn probe_size(&self, url: &str) -> Result<u64, TransferError> {
        let response = self
            .request(reqwest::Method::GET, url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match status.as_u16() {
            206 | 416 => content_range
                .as_deref()
                .and_then(parse_content_range_total)
                .ok_or_else(|| TransferError::Transport {
                    status: Some(status.as_u16()),
                    retryable: false,
                    message: format!(
                        "probe response missing usable Content-Range (got {:?})",
                        content_range
                    ),
                }),
            200 => {
                let body = response.bytes().await?;
                Ok(body.len() as u64)
            }
            code => Err(TransferError::from_status(
                code,
                format!("probe of {} failed with status {}", url, status),
            )),
        }
    }

    /// Fetch the byte range `[start, end)` of a blob.
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, TransferError> {
        let response = self
            .request(reqwest::Method::GET, url)
            .header(header::RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(
                status.as_u16(),
                format!("range GET of {} failed with status {}", url, status),
            ));
        }

        let body = response.bytes().await?;
        let expected = end - start;
        if (body.len() as u64) != expected {
            return Err(TransferError::Transport {
                status: Some(status.as_u16()),
                retryable: true,
                message: format!(
                    "range GET returned {} bytes, expected {}",
                    body.len(),
                    expected
                ),
            });
        }
        Ok(body)
    }

    /// Stage one block of an upload under a caller-chosen block id.
    pub async fn put_block(
        &self,
        url: &str,
        block_id: &str,
        body: Bytes,
    ) -> Result<(), TransferError> {
        let response = self
            .request(reqwest::Method::PUT, url)
            .query(&[("comp", "block"), ("blockid", block_id)])
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(
                status.as_u16(),
                format!("block PUT to {} failed with status {}", url, status),
            ));
        }
        Ok(())
    }

    /// Commit previously staged blocks into the final blob, in order.
    pub async fn commit_block_list(
        &self,
        url: &str,
        block_ids: &[String],
        content_type: Option<&str>,
    ) -> Result<(), TransferError> {
        let body = json!({
            "blocks": block_ids,
            "content_type": content_type,
        });

        let response = self
            .request(reqwest::Method::POST, url)
            .query(&[("comp", "blocklist")])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(
                status.as_u16(),
                format!("commit of {} failed with status {}", url, status),
            ));
        }
        Ok(())
    }
}

/// Extract the total size from a `Content-Range` header value, e.g.
/// `bytes 0-0/12345` or `bytes */0`. Returns None for `bytes 0-0/*`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.trim().rsplit('/').next()?;
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes */0"), Some(0));
        assert_eq!(parse_content_range_total("bytes 0-1023/1024"), Some(1024));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_client_carries_session_id() {
        let client = BlobClient::new(Duration::from_secs(30), "session-abc".into()).unwrap();
        assert_eq!(client.session_id(), "session-abc");
    }
}
