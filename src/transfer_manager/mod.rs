//! Transfer Manager module
//!
//! Provides a durable, resumable, chunked transfer engine for remote object
//! storage. Transfers decompose into byte-range blocks scheduled over a
//! bounded work queue; block-level progress persists across restarts.

mod client;
mod error;
mod manager;
mod models;
mod operations;
mod queue;
mod reachability;
mod retry_policy;
mod schema;
mod store;

pub use client::{BlobClient, SESSION_HEADER};
pub use error::{TransferError, TransferErrorKind, RETRYABLE_STATUSES};
pub use manager::{TransferDelegate, TransferManager, TransferRequest};
pub use models::*;
pub use operations::{block_layout, final_unit_id, partial_path};
pub use queue::{OperationOutput, QueueEvent, TransferOperation, UnitOutcome, WorkQueue};
pub use reachability::{Reachability, ReachabilityProbe, ReachabilityStatus};
pub use retry_policy::RetryPolicy;
pub use schema::TRANSFER_VERSIONED_SCHEMAS;
pub use store::{SqliteTransferStore, TransferStore, META_SESSION_ID};
