//! Data models for the transfer engine.
//!
//! Defines transfer records, the state machine, directions, and the
//! direction-specific properties persisted alongside each transfer.

use serde::{Deserialize, Serialize};

use super::error::TransferErrorKind;

/// Default chunk size used when a transfer does not specify one: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Direction of a blob transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "UPLOAD",
            TransferDirection::Download => "DOWNLOAD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "UPLOAD" => Some(TransferDirection::Upload),
            "DOWNLOAD" => Some(TransferDirection::Download),
            _ => None,
        }
    }
}

/// State of a transfer record (blob or block).
///
/// The same state machine applies to parents and children; a parent's state
/// is derived from its children by the manager but is also written directly
/// at major lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Pending,
    InProgress,
    Paused,
    Complete,
    Failed,
    Canceled,
    Deleted,
}

impl TransferState {
    /// Returns true for states that accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Canceled | TransferState::Deleted
        )
    }

    /// Records in these states respond to `pause`.
    pub fn is_pauseable(&self) -> bool {
        matches!(self, TransferState::Pending | TransferState::InProgress)
    }

    /// Records in these states respond to `resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(self, TransferState::Paused | TransferState::Failed)
    }

    /// The transition table. `remove` (to `Deleted`) is legal from any
    /// non-deleted state; everything else follows the narrow paths below.
    pub fn can_transition(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (_, Deleted) => self != Deleted,
            (Pending, InProgress) => true,
            (InProgress, InProgress) => true,
            (InProgress, Complete) => true,
            (InProgress, Failed) => true,
            (Pending | InProgress, Paused) => true,
            // resume: paused and failed records normalize back to pending
            (Paused | Failed, Pending) => true,
            (Pending | InProgress | Paused | Failed, Canceled) => true,
            _ => false,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "PENDING",
            TransferState::InProgress => "IN_PROGRESS",
            TransferState::Paused => "PAUSED",
            TransferState::Complete => "COMPLETE",
            TransferState::Failed => "FAILED",
            TransferState::Canceled => "CANCELED",
            TransferState::Deleted => "DELETED",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => TransferState::InProgress,
            "PAUSED" => TransferState::Paused,
            "COMPLETE" => TransferState::Complete,
            "FAILED" => TransferState::Failed,
            "CANCELED" => TransferState::Canceled,
            "DELETED" => TransferState::Deleted,
            _ => TransferState::Pending,
        }
    }
}

/// Direction-specific metadata persisted verbatim with a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProperties {
    /// Content type recorded on upload commit.
    pub content_type: Option<String>,
    /// Chunk size used for decomposition.
    pub block_size: u64,
}

impl Default for TransferProperties {
    fn default() -> Self {
        Self {
            content_type: None,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// A parent record: one logical blob upload or download.
#[derive(Debug, Clone)]
pub struct BlobTransfer {
    /// Unique identifier (UUID), generated once and persisted.
    pub id: String,
    pub direction: TransferDirection,
    /// Local path (upload) or remote URL (download).
    pub source: String,
    /// Remote URL (upload) or local path (download).
    pub destination: String,
    /// Opaque key used to re-obtain a live HTTP client after restart.
    pub client_restoration_id: String,
    pub properties: TransferProperties,
    pub state: TransferState,
    /// Number of child blocks, fixed at decomposition time.
    pub total_blocks: u32,
    /// True once the initial probe (download) has succeeded. Uploads know
    /// their layout up front and start with this set.
    pub initial_call_complete: bool,
    pub error_kind: Option<TransferErrorKind>,
    pub error_message: Option<String>,
    /// Owning multi-blob group, if any. Grouped blobs are not roots.
    pub group_id: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl BlobTransfer {
    pub fn new(
        direction: TransferDirection,
        source: String,
        destination: String,
        client_restoration_id: String,
        properties: TransferProperties,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            source,
            destination,
            client_restoration_id,
            properties,
            state: TransferState::Pending,
            total_blocks: 0,
            // Upload layouts come from the local file size; there is no
            // initial remote call to wait for.
            initial_call_complete: direction == TransferDirection::Upload,
            error_kind: None,
            error_message: None,
            group_id: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_group(mut self, group_id: String) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Roots are the records exposed through top-level enumeration.
    pub fn is_root(&self) -> bool {
        self.group_id.is_none()
    }

    pub fn record_error(&mut self, kind: TransferErrorKind, message: String) {
        self.error_kind = Some(kind);
        self.error_message = Some(message);
    }

    pub fn clear_error(&mut self) {
        self.error_kind = None;
        self.error_message = None;
    }
}

/// A child record: one contiguous byte range of a blob.
#[derive(Debug, Clone)]
pub struct BlockTransfer {
    /// Unique identifier. For uploads this doubles as the block id sent to
    /// the service, so it must be stable across restarts.
    pub id: String,
    /// Owning blob transfer. Detached blocks (no parent) are roots.
    pub parent_id: Option<String>,
    /// Byte offsets, half-open: `[start_range, end_range)`.
    pub start_range: u64,
    pub end_range: u64,
    /// Position in decomposition order; the commit list follows it.
    pub ordinal: u32,
    pub state: TransferState,
}

impl BlockTransfer {
    pub fn new(parent_id: &str, ordinal: u32, start_range: u64, end_range: u64) -> Self {
        Self {
            id: block_id(parent_id, ordinal),
            parent_id: Some(parent_id.to_string()),
            start_range,
            end_range,
            ordinal,
            state: TransferState::Pending,
        }
    }

    /// The 1-byte probe block used to discover a blob's total size.
    pub fn probe(parent_id: &str) -> Self {
        Self {
            id: format!("{}-probe", parent_id),
            parent_id: Some(parent_id.to_string()),
            start_range: 0,
            end_range: 1,
            ordinal: 0,
            state: TransferState::Pending,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.id.ends_with("-probe")
    }

    pub fn len(&self) -> u64 {
        self.end_range - self.start_range
    }

    pub fn is_empty(&self) -> bool {
        self.end_range == self.start_range
    }
}

/// Stable block identifier: parent id plus zero-padded ordinal, so that
/// lexicographic order matches decomposition order.
pub fn block_id(parent_id: &str, ordinal: u32) -> String {
    format!("{}-{:06}", parent_id, ordinal)
}

/// A group of blob transfers managed as one unit (e.g. a directory).
#[derive(Debug, Clone)]
pub struct MultiBlobTransfer {
    pub id: String,
    pub state: TransferState,
    pub created_at: i64,
}

impl MultiBlobTransfer {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: TransferState::Pending,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl Default for MultiBlobTransfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tagged view over the record kinds, used at the few sites that branch on
/// kind (top-level enumeration, snapshots).
#[derive(Debug, Clone)]
pub enum TransferRecord {
    Blob(BlobTransfer),
    Block(BlockTransfer),
    Group(MultiBlobTransfer),
}

impl TransferRecord {
    pub fn id(&self) -> &str {
        match self {
            TransferRecord::Blob(b) => &b.id,
            TransferRecord::Block(b) => &b.id,
            TransferRecord::Group(g) => &g.id,
        }
    }

    pub fn state(&self) -> TransferState {
        match self {
            TransferRecord::Blob(b) => b.state,
            TransferRecord::Block(b) => b.state,
            TransferRecord::Group(g) => g.state,
        }
    }
}
