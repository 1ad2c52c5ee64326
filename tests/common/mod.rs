//! In-process fake object-storage service for end-to-end tests.
//!
//! Implements the four calls the engine consumes: range GET (with probe
//! semantics), block PUT, commit-block-list POST. Supports fault injection
//! (fail the next N requests with 503) and artificial per-request latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

#[derive(Default)]
struct StoredBlob {
    committed: Option<Vec<u8>>,
    staged: HashMap<String, Vec<u8>>,
    commit_order: Vec<String>,
}

#[derive(Default)]
pub struct BlobServiceState {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    /// Fail the next N requests with 503.
    fail_next: AtomicUsize,
    /// Artificial latency applied to every request.
    delay_ms: AtomicU64,
    /// Number of block PUTs observed.
    put_count: AtomicUsize,
}

pub struct BlobService {
    pub base_url: String,
    state: Arc<BlobServiceState>,
}

impl BlobService {
    pub async fn spawn() -> Self {
        let state = Arc::new(BlobServiceState::default());
        let app = Router::new()
            .route("/blobs/{name}", get(get_blob).put(put_blob).post(post_blob))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn blob_url(&self, name: &str) -> String {
        format!("{}/blobs/{}", self.base_url, name)
    }

    /// Pre-populate a committed blob, as if uploaded earlier.
    pub fn put_committed(&self, name: &str, bytes: Vec<u8>) {
        let mut blobs = self.state.blobs.lock().unwrap();
        blobs.entry(name.to_string()).or_default().committed = Some(bytes);
    }

    /// Pre-stage a block, as if a previous process had uploaded it.
    pub fn stage_block(&self, name: &str, block_id: &str, bytes: Vec<u8>) {
        let mut blobs = self.state.blobs.lock().unwrap();
        blobs
            .entry(name.to_string())
            .or_default()
            .staged
            .insert(block_id.to_string(), bytes);
    }

    pub fn committed(&self, name: &str) -> Option<Vec<u8>> {
        let blobs = self.state.blobs.lock().unwrap();
        blobs.get(name).and_then(|b| b.committed.clone())
    }

    /// Block ids of the last commit, in the order they were listed.
    pub fn commit_order(&self, name: &str) -> Vec<String> {
        let blobs = self.state.blobs.lock().unwrap();
        blobs
            .get(name)
            .map(|b| b.commit_order.clone())
            .unwrap_or_default()
    }

    /// Fail the next `n` requests with 503.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.state.put_count.load(Ordering::SeqCst)
    }
}

async fn maybe_fault(state: &BlobServiceState) -> Option<Response> {
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let injected = state
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if injected {
        return Some((StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response());
    }
    None
}

/// `Range: bytes=a-b` (inclusive offsets) or None.
fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn get_blob(
    State(state): State<Arc<BlobServiceState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(fault) = maybe_fault(&state).await {
        return fault;
    }

    let blobs = state.blobs.lock().unwrap();
    let Some(committed) = blobs.get(&name).and_then(|b| b.committed.as_ref()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = committed.len() as u64;

    match parse_range(&headers) {
        Some((start, end_inclusive)) => {
            if start >= total {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response();
            }
            let end = end_inclusive.min(total - 1);
            let body = committed[start as usize..=end as usize].to_vec();
            (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))],
                body,
            )
                .into_response()
        }
        None => (StatusCode::OK, committed.clone()).into_response(),
    }
}

async fn put_blob(
    State(state): State<Arc<BlobServiceState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Some(fault) = maybe_fault(&state).await {
        return fault;
    }

    if params.get("comp").map(String::as_str) != Some("block") {
        return (StatusCode::BAD_REQUEST, "expected comp=block").into_response();
    }
    let Some(block_id) = params.get("blockid") else {
        return (StatusCode::BAD_REQUEST, "missing blockid").into_response();
    };

    state.put_count.fetch_add(1, Ordering::SeqCst);
    let mut blobs = state.blobs.lock().unwrap();
    blobs
        .entry(name)
        .or_default()
        .staged
        .insert(block_id.clone(), body.to_vec());
    StatusCode::CREATED.into_response()
}

#[derive(Deserialize)]
struct CommitRequest {
    blocks: Vec<String>,
    #[allow(dead_code)]
    content_type: Option<String>,
}

async fn post_blob(
    State(state): State<Arc<BlobServiceState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    axum::Json(request): axum::Json<CommitRequest>,
) -> Response {
    if let Some(fault) = maybe_fault(&state).await {
        return fault;
    }

    if params.get("comp").map(String::as_str) != Some("blocklist") {
        return (StatusCode::BAD_REQUEST, "expected comp=blocklist").into_response();
    }

    let mut blobs = state.blobs.lock().unwrap();
    let blob = blobs.entry(name).or_default();

    let mut assembled = Vec::new();
    for block_id in &request.blocks {
        let Some(bytes) = blob.staged.get(block_id) else {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown block id {}", block_id),
            )
                .into_response();
        };
        assembled.extend_from_slice(bytes);
    }

    blob.committed = Some(assembled);
    blob.commit_order = request.blocks;
    StatusCode::OK.into_response()
}
