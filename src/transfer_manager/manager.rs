//! Transfer manager facade.
//!
//! Coordinates the persistent store, the work queue, and the reachability
//! monitor. Commands execute on the caller's thread and mutate manager-owned
//! structures; long work is always deferred to the queue. The event loop
//! (`run`) consumes queue events and reachability flips.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferSettings;

use super::client::BlobClient;
use super::error::TransferError;
use super::models::{
    BlobTransfer, BlockTransfer, MultiBlobTransfer, TransferDirection, TransferProperties,
    TransferRecord, TransferState,
};
use super::operations::{
    block_layout, final_unit_id, partial_path, DownloadBlockOperation, DownloadFinalOperation,
    DownloadInitialOperation, UploadBlockOperation, UploadFinalOperation,
};
use super::queue::{QueueEvent, TransferOperation, UnitOutcome, WorkQueue};
use super::reachability::{Reachability, ReachabilityStatus};
use super::retry_policy::RetryPolicy;
use super::store::{TransferStore, META_SESSION_ID};

/// Observer and client source for the manager.
///
/// The manager tolerates delegate absence: notifications are dropped until
/// one is registered.
pub trait TransferDelegate: Send + Sync {
    /// Supply a live HTTP client for a persisted restoration id.
    fn client_for_restoration_id(&self, restoration_id: &str) -> Option<Arc<BlobClient>>;

    /// Observe a state change of a transfer or one of its blocks.
    fn transfer_did_change_state(&self, transfer_id: &str, new_state: TransferState);
}

/// A partially populated transfer handed to [`TransferManager::add`].
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    pub client_restoration_id: String,
    pub properties: TransferProperties,
}

impl TransferRequest {
    pub fn upload(source: String, destination: String, client_restoration_id: String) -> Self {
        Self {
            direction: TransferDirection::Upload,
            source,
            destination,
            client_restoration_id,
            properties: TransferProperties::default(),
        }
    }

    pub fn download(source: String, destination: String, client_restoration_id: String) -> Self {
        Self {
            direction: TransferDirection::Download,
            source,
            destination,
            client_restoration_id,
            properties: TransferProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: TransferProperties) -> Self {
        self.properties = properties;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RootKey {
    Blob(String),
    Block(String),
    Group(String),
}

#[derive(Default)]
struct ManagerState {
    blobs: HashMap<String, BlobTransfer>,
    blocks: HashMap<String, BlockTransfer>,
    /// Blob id to block ids, in decomposition order.
    children: HashMap<String, Vec<String>>,
    groups: HashMap<String, MultiBlobTransfer>,
    group_members: HashMap<String, Vec<String>>,
    /// Top-level enumeration order.
    roots: Vec<RootKey>,
}

type Notifications = Vec<(String, TransferState)>;

/// The transfer manager.
///
/// One manager owns one progress store; constructing a second manager on the
/// same store path fails at store-open time. Commands are idempotent:
/// invalid-state requests are silent no-ops.
pub struct TransferManager {
    store: Arc<dyn TransferStore>,
    retry: RetryPolicy,
    queue: WorkQueue,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
    reachability: Reachability,
    state: Mutex<ManagerState>,
    delegate: RwLock<Option<Arc<dyn TransferDelegate>>>,
    clients: Mutex<HashMap<String, Arc<BlobClient>>>,
    session_id: String,
}

impl TransferManager {
    /// Create a manager over an open store and hydrate in-memory state from
    /// it. Must be called within a Tokio runtime.
    ///
    /// Records left `IN_PROGRESS` by a previous process are normalized to
    /// `PAUSED` so they can be resumed.
    pub fn new(store: Arc<dyn TransferStore>, settings: TransferSettings) -> Result<Self> {
        let session_id = match store.get_meta(META_SESSION_ID)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store.set_meta(META_SESSION_ID, &id)?;
                id
            }
        };

        let (queue, events_rx) = WorkQueue::new(settings.max_concurrent);
        let retry = RetryPolicy::from_settings(&settings);

        let manager = Self {
            store,
            retry,
            queue,
            events_rx: Mutex::new(Some(events_rx)),
            reachability: Reachability::default(),
            state: Mutex::new(ManagerState::default()),
            delegate: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
            session_id,
        };

        manager.load_context()?;
        Ok(manager)
    }

    /// Hydrate in-memory state from the store.
    fn load_context(&self) -> Result<()> {
        let groups = self.store.fetch_groups()?;
        let root_blobs = self.store.fetch_root_blobs()?;
        let root_blocks = self.store.fetch_root_blocks()?;

        let mut state = self.state.lock().unwrap();
        let mut ordered_roots: Vec<(i64, RootKey)> = Vec::new();

        let mut all_blobs = root_blobs;
        for group in groups {
            let members = self.store.fetch_group_members(&group.id)?;
            state
                .group_members
                .insert(group.id.clone(), members.iter().map(|b| b.id.clone()).collect());
            ordered_roots.push((group.created_at, RootKey::Group(group.id.clone())));
            state.groups.insert(group.id.clone(), group);
            all_blobs.extend(members);
        }

        for mut blob in all_blobs {
            if blob.is_root() {
                ordered_roots.push((blob.created_at, RootKey::Blob(blob.id.clone())));
            }
            if blob.state == TransferState::InProgress {
                blob.state = TransferState::Paused;
                self.store.upsert_blob(&blob)?;
            }

            let blocks = self.store.fetch_blocks(&blob.id)?;
            let mut child_ids = Vec::with_capacity(blocks.len());
            for mut block in blocks {
                if block.state == TransferState::InProgress {
                    block.state = TransferState::Paused;
                    self.store.upsert_block(&block)?;
                }
                child_ids.push(block.id.clone());
                state.blocks.insert(block.id.clone(), block);
            }
            state.children.insert(blob.id.clone(), child_ids);
            state.blobs.insert(blob.id.clone(), blob);
        }

        ordered_roots.sort_by(|a, b| a.0.cmp(&b.0));
        state.roots = ordered_roots.into_iter().map(|(_, key)| key).collect();

        for block in root_blocks {
            state.roots.push(RootKey::Block(block.id.clone()));
            state.blocks.insert(block.id.clone(), block);
        }

        info!(
            "Hydrated {} transfers, {} groups from store",
            state.blobs.len(),
            state.groups.len()
        );
        drop(state);

        self.persist();
        Ok(())
    }

    /// Register the delegate. Late-init; may be swapped at any time.
    pub fn set_delegate(&self, delegate: Arc<dyn TransferDelegate>) {
        *self.delegate.write().unwrap() = Some(delegate);
    }

    /// Register a live client for a restoration id ahead of time.
    pub fn register_client(&self, restoration_id: &str, client: Arc<BlobClient>) {
        self.clients
            .lock()
            .unwrap()
            .insert(restoration_id.to_string(), client);
    }

    /// The reachability handle. Probes publish through it; tests drive it
    /// directly.
    pub fn reachability(&self) -> Reachability {
        self.reachability.clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability.is_reachable()
    }

    /// Stable HTTP session identifier, persisted across launches.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Accept a transfer. Uploads decompose immediately from the source file
    /// size; downloads get a probe block. Returns the new transfer id.
    ///
    /// Failures (decomposition, client restoration) are recorded on the
    /// transfer, which transitions to `FAILED` and is reported via the
    /// delegate.
    pub fn add(&self, request: TransferRequest) -> String {
        self.add_internal(request, None)
    }

    /// Accept several transfers as one group; group commands cascade to all
    /// members. Returns the group id.
    pub fn add_group(&self, requests: Vec<TransferRequest>) -> String {
        let group = MultiBlobTransfer::new();
        let group_id = group.id.clone();
        if let Err(e) = self.store.upsert_group(&group) {
            warn!("Failed to buffer group insert: {}", e);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.groups.insert(group_id.clone(), group);
            state.group_members.insert(group_id.clone(), Vec::new());
            state.roots.push(RootKey::Group(group_id.clone()));
        }
        for request in requests {
            self.add_internal(request, Some(group_id.clone()));
        }
        self.persist();
        group_id
    }

    fn add_internal(&self, request: TransferRequest, group_id: Option<String>) -> String {
        let mut blob = BlobTransfer::new(
            request.direction,
            request.source,
            request.destination,
            request.client_restoration_id,
            request.properties,
        );
        if let Some(gid) = group_id.clone() {
            blob = blob.with_group(gid);
        }
        let blob_id = blob.id.clone();

        let mut blocks = Vec::new();
        let mut decomposition_error = None;

        if blob.properties.block_size == 0 {
            decomposition_error = Some("block size must be positive".to_string());
        } else {
            match blob.direction {
                TransferDirection::Upload => match std::fs::metadata(&blob.source) {
                    Ok(meta) => {
                        let layout = block_layout(meta.len(), blob.properties.block_size);
                        blob.total_blocks = layout.len() as u32;
                        for (ordinal, (start, end)) in layout.into_iter().enumerate() {
                            blocks.push(BlockTransfer::new(&blob.id, ordinal as u32, start, end));
                        }
                    }
                    Err(e) => {
                        decomposition_error =
                            Some(format!("cannot stat source {}: {}", blob.source, e));
                    }
                },
                TransferDirection::Download => {
                    blocks.push(BlockTransfer::probe(&blob.id));
                }
            }
        }

        if let Some(message) = decomposition_error {
            blob.state = TransferState::Failed;
            blob.record_error(
                TransferError::Decomposition(message.clone()).kind(),
                message,
            );
        }

        if let Err(e) = self.store.upsert_blob(&blob) {
            warn!("Failed to buffer transfer insert: {}", e);
        }
        for block in &blocks {
            if let Err(e) = self.store.upsert_block(block) {
                warn!("Failed to buffer block insert: {}", e);
            }
        }

        let failed = blob.state == TransferState::Failed;
        {
            let mut state = self.state.lock().unwrap();
            if blob.is_root() {
                state.roots.push(RootKey::Blob(blob_id.clone()));
            } else if let Some(gid) = &group_id {
                if let Some(members) = state.group_members.get_mut(gid) {
                    members.push(blob_id.clone());
                }
            }
            state
                .children
                .insert(blob_id.clone(), blocks.iter().map(|b| b.id.clone()).collect());
            for block in blocks {
                state.blocks.insert(block.id.clone(), block);
            }
            state.blobs.insert(blob_id.clone(), blob);
        }

        self.persist();
        if failed {
            self.emit(vec![(blob_id.clone(), TransferState::Failed)]);
        } else {
            info!("Added transfer {}", blob_id);
            self.queue_operations(&blob_id);
        }
        blob_id
    }

    /// Pause a transfer (or group) and every pauseable child.
    pub fn pause(&self, id: &str) {
        let targets = self.resolve_blobs(id);
        let mut notes = Vec::new();
        for blob_id in &targets {
            self.queue.remove_parent(blob_id);
            let mut state = self.state.lock().unwrap();
            notes.extend(self.pause_blob_locked(&mut state, blob_id));
        }
        self.set_group_state(id, TransferState::Paused, &mut notes);
        self.persist();
        self.emit(notes);
    }

    /// Pause every pauseable transfer. Clears the queue as a fast path.
    pub fn pause_all(&self) {
        self.queue.clear();
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let blob_ids: Vec<String> = state.blobs.keys().cloned().collect();
            for blob_id in blob_ids {
                notes.extend(self.pause_blob_locked(&mut state, &blob_id));
            }
            let group_ids: Vec<String> = state.groups.keys().cloned().collect();
            for gid in group_ids {
                notes.extend(self.transition_group_locked(&mut state, &gid, TransferState::Paused));
            }
        }
        self.persist();
        self.emit(notes);
    }

    /// Resume a paused or failed transfer (or group). No-op while the
    /// network is unreachable. Retained children stay complete; the rest are
    /// normalized to pending and re-enqueued.
    pub fn resume(&self, id: &str) {
        if !self.reachability.is_reachable() {
            debug!("Ignoring resume of {} while unreachable", id);
            return;
        }
        let targets = self.resolve_blobs(id);
        let mut notes = Vec::new();
        let mut to_queue = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for blob_id in &targets {
                if let Some(n) = self.resume_blob_locked(&mut state, blob_id) {
                    notes.extend(n);
                    to_queue.push(blob_id.clone());
                }
            }
        }
        self.set_group_state(id, TransferState::Pending, &mut notes);
        self.persist();
        for blob_id in &to_queue {
            self.queue_operations(blob_id);
        }
        self.emit(notes);
    }

    /// Resume every resumable transfer.
    pub fn resume_all(&self) {
        if !self.reachability.is_reachable() {
            debug!("Ignoring resume_all while unreachable");
            return;
        }
        let mut notes = Vec::new();
        let mut to_queue = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let blob_ids: Vec<String> = state.blobs.keys().cloned().collect();
            for blob_id in blob_ids {
                if let Some(n) = self.resume_blob_locked(&mut state, &blob_id) {
                    notes.extend(n);
                    to_queue.push(blob_id);
                }
            }
            let group_ids: Vec<String> = state.groups.keys().cloned().collect();
            for gid in group_ids {
                notes.extend(self.transition_group_locked(
                    &mut state,
                    &gid,
                    TransferState::Pending,
                ));
            }
        }
        self.persist();
        for blob_id in &to_queue {
            self.queue_operations(blob_id);
        }
        self.emit(notes);
    }

    /// Cancel a transfer (or group) and its children. Terminal transfers are
    /// unaffected.
    pub fn cancel(&self, id: &str) {
        let targets = self.resolve_blobs(id);
        let mut notes = Vec::new();
        for blob_id in &targets {
            self.queue.remove_parent(blob_id);
            let mut state = self.state.lock().unwrap();
            notes.extend(self.cancel_blob_locked(&mut state, blob_id));
        }
        self.set_group_state(id, TransferState::Canceled, &mut notes);
        self.persist();
        self.emit(notes);
    }

    pub fn cancel_all(&self) {
        self.queue.clear();
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let blob_ids: Vec<String> = state.blobs.keys().cloned().collect();
            for blob_id in blob_ids {
                notes.extend(self.cancel_blob_locked(&mut state, &blob_id));
            }
            let group_ids: Vec<String> = state.groups.keys().cloned().collect();
            for gid in group_ids {
                notes.extend(self.transition_group_locked(
                    &mut state,
                    &gid,
                    TransferState::Canceled,
                ));
            }
        }
        self.persist();
        self.emit(notes);
    }

    /// Remove a transfer (or group): drops queue units, deletes the records
    /// (cascading to children), and cleans up partial download files.
    pub fn remove(&self, id: &str) {
        let mut notes = Vec::new();
        let is_group = self.state.lock().unwrap().groups.contains_key(id);
        let targets = self.resolve_blobs(id);

        for blob_id in &targets {
            self.queue.remove_parent(blob_id);
            let removed = {
                let mut state = self.state.lock().unwrap();
                self.remove_blob_locked(&mut state, blob_id)
            };
            if let Some(blob) = removed {
                if blob.direction == TransferDirection::Download {
                    let partial = partial_path(&blob.destination);
                    let _ = std::fs::remove_file(&partial);
                }
                if let Err(e) = self.store.delete_blob(blob_id) {
                    warn!("Failed to buffer transfer delete: {}", e);
                }
                notes.push((blob_id.clone(), TransferState::Deleted));
            }
        }

        if is_group {
            {
                let mut state = self.state.lock().unwrap();
                state.groups.remove(id);
                state.group_members.remove(id);
                state.roots.retain(|k| k != &RootKey::Group(id.to_string()));
            }
            if let Err(e) = self.store.delete_group(id) {
                warn!("Failed to buffer group delete: {}", e);
            }
            notes.push((id.to_string(), TransferState::Deleted));
        }

        self.persist();
        self.emit(notes);
    }

    pub fn remove_all(&self) {
        self.queue.clear();
        let root_ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .roots
                .iter()
                .map(|k| match k {
                    RootKey::Blob(id) | RootKey::Block(id) | RootKey::Group(id) => id.clone(),
                })
                .collect()
        };
        for id in root_ids {
            self.remove(&id);
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Number of top-level records (transfers, groups, detached blocks).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexed read over top-level records. Returns a snapshot.
    pub fn get(&self, index: usize) -> Option<TransferRecord> {
        let state = self.state.lock().unwrap();
        let key = state.roots.get(index)?;
        Some(match key {
            RootKey::Blob(id) => TransferRecord::Blob(state.blobs.get(id)?.clone()),
            RootKey::Block(id) => TransferRecord::Block(state.blocks.get(id)?.clone()),
            RootKey::Group(id) => TransferRecord::Group(state.groups.get(id)?.clone()),
        })
    }

    /// Snapshot of a record by id.
    pub fn transfer(&self, id: &str) -> Option<TransferRecord> {
        let state = self.state.lock().unwrap();
        if let Some(blob) = state.blobs.get(id) {
            return Some(TransferRecord::Blob(blob.clone()));
        }
        if let Some(group) = state.groups.get(id) {
            return Some(TransferRecord::Group(group.clone()));
        }
        state.blocks.get(id).map(|b| TransferRecord::Block(b.clone()))
    }

    /// Snapshot of a transfer's blocks, in decomposition order.
    pub fn blocks_of(&self, id: &str) -> Vec<BlockTransfer> {
        let state = self.state.lock().unwrap();
        state
            .children
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|bid| state.blocks.get(bid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Consume queue events and reachability flips until shutdown. Call once,
    /// from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut events = match self.events_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("Transfer manager event loop already running");
                return;
            }
        };
        let mut reach_rx = self.reachability.subscribe();

        info!("Transfer manager event loop starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = reach_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *reach_rx.borrow_and_update();
                    self.handle_reachability(status);
                }
                event = events.recv() => match event {
                    Some(e) => self.handle_queue_event(e),
                    None => break,
                },
            }
        }
        self.queue.shutdown();
        info!("Transfer manager event loop stopped");
    }

    /// Spawn the event loop on the current runtime.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    }

    fn handle_reachability(&self, status: ReachabilityStatus) {
        if status.is_reachable() {
            info!("Network reachable, resuming transfers");
            self.queue.clear();
            self.resume_all();
        } else {
            info!("Network unreachable, pausing transfers");
            self.pause_all();
        }
    }

    fn handle_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Started { unit_id, parent_id } => {
                self.handle_unit_started(&unit_id, parent_id.as_deref());
            }
            QueueEvent::Finished {
                unit_id,
                parent_id,
                outcome,
            } => match outcome {
                UnitOutcome::Completed(output) => {
                    self.handle_unit_completed(&unit_id, parent_id.as_deref(), output.total_size);
                }
                UnitOutcome::Failed(error) => {
                    self.handle_unit_failed(&unit_id, parent_id.as_deref(), error);
                }
                UnitOutcome::Canceled => {
                    self.handle_unit_canceled(&unit_id);
                }
            },
        }
    }

    fn handle_unit_started(&self, unit_id: &str, parent_id: Option<&str>) {
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(block) = state.blocks.get_mut(unit_id) {
                if Self::transition_block(block, TransferState::InProgress) {
                    notes.push((block.id.clone(), TransferState::InProgress));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            }
            if let Some(blob) = parent_id.and_then(|p| state.blobs.get_mut(p)) {
                if Self::transition_blob(blob, TransferState::InProgress) {
                    notes.push((blob.id.clone(), TransferState::InProgress));
                    let blob = blob.clone();
                    self.buffer_blob(&blob);
                }
            }
        }
        self.persist();
        self.emit(notes);
    }

    fn handle_unit_completed(
        &self,
        unit_id: &str,
        parent_id: Option<&str>,
        total_size: Option<u64>,
    ) {
        let Some(parent_id) = parent_id else { return };

        // Probe completion builds the real child set.
        let is_probe = {
            let state = self.state.lock().unwrap();
            state
                .blocks
                .get(unit_id)
                .map(|b| b.is_probe())
                .unwrap_or(false)
        };
        if is_probe {
            self.handle_probe_completed(unit_id, parent_id, total_size);
            return;
        }

        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if unit_id == final_unit_id(parent_id) {
                if let Some(blob) = state.blobs.get_mut(parent_id) {
                    if Self::transition_blob(blob, TransferState::Complete) {
                        notes.push((blob.id.clone(), TransferState::Complete));
                        let blob = blob.clone();
                        self.buffer_blob(&blob);
                        info!("Transfer {} complete", parent_id);
                    }
                }
                let group_id = state
                    .blobs
                    .get(parent_id)
                    .and_then(|b| b.group_id.clone());
                if let Some(gid) = group_id {
                    notes.extend(self.derive_group_state_locked(&mut state, &gid));
                }
            } else if let Some(block) = state.blocks.get_mut(unit_id) {
                if Self::transition_block(block, TransferState::Complete) {
                    notes.push((block.id.clone(), TransferState::Complete));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            } else {
                // Completion for a unit whose records are gone (removed
                // mid-flight); nothing to update.
                debug!("Dropping completion for unknown unit {}", unit_id);
            }
        }
        self.persist();
        self.emit(notes);
    }

    fn handle_probe_completed(&self, unit_id: &str, parent_id: &str, total_size: Option<u64>) {
        let Some(size) = total_size else {
            self.fail_transfer(
                parent_id,
                TransferError::Decomposition("probe reported no size".into()),
            );
            return;
        };

        {
            let mut state = self.state.lock().unwrap();
            let Some(blob) = state.blobs.get_mut(parent_id) else {
                return;
            };
            blob.initial_call_complete = true;

            let layout = block_layout(size, blob.properties.block_size);
            blob.total_blocks = layout.len() as u32;
            let blob_snapshot = blob.clone();
            self.buffer_blob(&blob_snapshot);

            // The probe block's job is done; replace it with the real children.
            state.blocks.remove(unit_id);
            if let Err(e) = self.store.delete_block(unit_id) {
                warn!("Failed to buffer probe delete: {}", e);
            }

            let mut child_ids = Vec::with_capacity(layout.len());
            for (ordinal, (start, end)) in layout.into_iter().enumerate() {
                let block = BlockTransfer::new(parent_id, ordinal as u32, start, end);
                self.buffer_block(&block);
                child_ids.push(block.id.clone());
                state.blocks.insert(block.id.clone(), block);
            }
            state.children.insert(parent_id.to_string(), child_ids);
            debug!(
                "Probe of {} reported {} bytes, {} blocks",
                parent_id, size, blob_snapshot.total_blocks
            );
        }

        self.persist();
        self.queue_operations(parent_id);
    }

    fn handle_unit_failed(&self, unit_id: &str, parent_id: Option<&str>, error: TransferError) {
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(block) = state.blocks.get_mut(unit_id) {
                if Self::transition_block(block, TransferState::Failed) {
                    notes.push((block.id.clone(), TransferState::Failed));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            }
            let mut group_id = None;
            if let Some(blob) = parent_id.and_then(|p| state.blobs.get_mut(p)) {
                group_id = blob.group_id.clone();
                if !blob.state.is_terminal() && blob.state != TransferState::Failed {
                    blob.state = TransferState::Failed;
                    blob.record_error(error.kind(), error.to_string());
                    notes.push((blob.id.clone(), TransferState::Failed));
                    let blob = blob.clone();
                    self.buffer_blob(&blob);
                    warn!("Transfer {} failed: {}", blob.id, error);
                }
            }
            if let Some(gid) = group_id {
                notes.extend(self.derive_group_state_locked(&mut state, &gid));
            }
        }
        // Sibling units of a failed transfer are withdrawn; their blocks
        // return to paused as their cancellations drain through the loop.
        if let Some(parent) = parent_id {
            self.queue.remove_parent(parent);
        }
        self.persist();
        self.emit(notes);
    }

    fn handle_unit_canceled(&self, unit_id: &str) {
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(block) = state.blocks.get_mut(unit_id) {
                // A unit withdrawn while running (pause, clear, or sibling
                // failure) leaves its block resumable. User-initiated cancel
                // has already moved the block to a terminal state.
                if block.state == TransferState::InProgress {
                    block.state = TransferState::Paused;
                    notes.push((block.id.clone(), TransferState::Paused));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            }
        }
        self.persist();
        self.emit(notes);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Blob ids a command on `id` applies to: the blob itself, or every
    /// member when `id` names a group.
    fn resolve_blobs(&self, id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        if let Some(members) = state.group_members.get(id) {
            members.clone()
        } else if state.blobs.contains_key(id) {
            vec![id.to_string()]
        } else {
            Vec::new()
        }
    }

    fn set_group_state(&self, id: &str, next: TransferState, notes: &mut Notifications) {
        let mut state = self.state.lock().unwrap();
        if state.groups.contains_key(id) {
            notes.extend(self.transition_group_locked(&mut state, id, next));
        }
    }

    fn transition_blob(blob: &mut BlobTransfer, next: TransferState) -> bool {
        if blob.state != next && blob.state.can_transition(next) {
            blob.state = next;
            true
        } else {
            false
        }
    }

    fn transition_block(block: &mut BlockTransfer, next: TransferState) -> bool {
        if block.state != next && block.state.can_transition(next) {
            block.state = next;
            true
        } else {
            false
        }
    }

    fn pause_blob_locked(&self, state: &mut ManagerState, blob_id: &str) -> Notifications {
        let mut notes = Vec::new();
        if let Some(blob) = state.blobs.get_mut(blob_id) {
            if Self::transition_blob(blob, TransferState::Paused) {
                notes.push((blob.id.clone(), TransferState::Paused));
                let blob = blob.clone();
                self.buffer_blob(&blob);
            }
        }
        for block_id in state.children.get(blob_id).cloned().unwrap_or_default() {
            if let Some(block) = state.blocks.get_mut(&block_id) {
                if Self::transition_block(block, TransferState::Paused) {
                    notes.push((block.id.clone(), TransferState::Paused));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            }
        }
        notes
    }

    /// Returns notifications and whether the blob should be re-enqueued.
    fn resume_blob_locked(
        &self,
        state: &mut ManagerState,
        blob_id: &str,
    ) -> Option<Notifications> {
        let blob = state.blobs.get_mut(blob_id)?;
        if !blob.state.is_resumable() {
            return None;
        }
        let mut notes = Vec::new();
        blob.clear_error();
        blob.state = TransferState::Pending;
        // Reported even when nothing else changes, so delegates observe the
        // resume.
        notes.push((blob.id.clone(), TransferState::Pending));
        let blob = blob.clone();
        self.buffer_blob(&blob);

        for block_id in state.children.get(blob_id).cloned().unwrap_or_default() {
            if let Some(block) = state.blocks.get_mut(&block_id) {
                match block.state {
                    TransferState::Complete
                    | TransferState::Canceled
                    | TransferState::Deleted => {}
                    TransferState::Pending => {}
                    _ => {
                        block.state = TransferState::Pending;
                        notes.push((block.id.clone(), TransferState::Pending));
                        let block = block.clone();
                        self.buffer_block(&block);
                    }
                }
            }
        }
        Some(notes)
    }

    fn cancel_blob_locked(&self, state: &mut ManagerState, blob_id: &str) -> Notifications {
        let mut notes = Vec::new();
        if let Some(blob) = state.blobs.get_mut(blob_id) {
            if Self::transition_blob(blob, TransferState::Canceled) {
                notes.push((blob.id.clone(), TransferState::Canceled));
                let blob = blob.clone();
                self.buffer_blob(&blob);
            }
        }
        for block_id in state.children.get(blob_id).cloned().unwrap_or_default() {
            if let Some(block) = state.blocks.get_mut(&block_id) {
                if Self::transition_block(block, TransferState::Canceled) {
                    notes.push((block.id.clone(), TransferState::Canceled));
                    let block = block.clone();
                    self.buffer_block(&block);
                }
            }
        }
        notes
    }

    fn remove_blob_locked(
        &self,
        state: &mut ManagerState,
        blob_id: &str,
    ) -> Option<BlobTransfer> {
        let blob = state.blobs.remove(blob_id)?;
        for block_id in state.children.remove(blob_id).unwrap_or_default() {
            state.blocks.remove(&block_id);
        }
        state.roots.retain(|k| k != &RootKey::Blob(blob_id.to_string()));
        if let Some(gid) = &blob.group_id {
            if let Some(members) = state.group_members.get_mut(gid) {
                members.retain(|m| m != blob_id);
            }
        }
        Some(blob)
    }

    /// Derive a group's state once all members are terminal.
    fn derive_group_state_locked(
        &self,
        state: &mut ManagerState,
        group_id: &str,
    ) -> Notifications {
        let members = state.group_members.get(group_id).cloned().unwrap_or_default();
        let states: Vec<TransferState> = members
            .iter()
            .filter_map(|id| state.blobs.get(id).map(|b| b.state))
            .collect();
        if states.is_empty() || !states.iter().all(|s| s.is_terminal() || *s == TransferState::Failed)
        {
            return Vec::new();
        }

        let next = if states.iter().all(|s| *s == TransferState::Complete) {
            TransferState::Complete
        } else if states.iter().any(|s| *s == TransferState::Failed) {
            TransferState::Failed
        } else {
            TransferState::Canceled
        };
        self.transition_group_locked(state, group_id, next)
    }

    fn transition_group_locked(
        &self,
        state: &mut ManagerState,
        group_id: &str,
        next: TransferState,
    ) -> Notifications {
        let mut notes = Vec::new();
        if let Some(group) = state.groups.get_mut(group_id) {
            if group.state != next && group.state.can_transition(next) {
                group.state = next;
                notes.push((group.id.clone(), next));
                if let Err(e) = self.store.upsert_group(group) {
                    warn!("Failed to buffer group update: {}", e);
                }
            }
        }
        notes
    }

    /// Mark a transfer failed outside the unit-error path (client
    /// restoration, decomposition after probe).
    fn fail_transfer(&self, blob_id: &str, error: TransferError) {
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(blob) = state.blobs.get_mut(blob_id) {
                if !blob.state.is_terminal() && blob.state != TransferState::Failed {
                    blob.state = TransferState::Failed;
                    blob.record_error(error.kind(), error.to_string());
                    notes.push((blob.id.clone(), TransferState::Failed));
                    let blob = blob.clone();
                    self.buffer_blob(&blob);
                    warn!("Transfer {} failed: {}", blob_id, error);
                }
            }
        }
        self.persist();
        self.emit(notes);
    }

    fn obtain_client(&self, restoration_id: &str) -> Option<Arc<BlobClient>> {
        if let Some(client) = self.clients.lock().unwrap().get(restoration_id) {
            return Some(client.clone());
        }
        let delegate = self.delegate.read().unwrap().clone();
        if let Some(delegate) = delegate {
            if let Some(client) = delegate.client_for_restoration_id(restoration_id) {
                self.clients
                    .lock()
                    .unwrap()
                    .insert(restoration_id.to_string(), client.clone());
                return Some(client);
            }
        }
        None
    }

    /// Build and enqueue the work units a transfer currently needs.
    fn queue_operations(&self, blob_id: &str) {
        let (blob, blocks) = {
            let state = self.state.lock().unwrap();
            let Some(blob) = state.blobs.get(blob_id) else {
                return;
            };
            if blob.state != TransferState::Pending && blob.state != TransferState::InProgress {
                return;
            }
            let blocks: Vec<BlockTransfer> = state
                .children
                .get(blob_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|bid| state.blocks.get(bid).cloned())
                        .collect()
                })
                .unwrap_or_default();
            (blob.clone(), blocks)
        };

        let Some(client) = self.obtain_client(&blob.client_restoration_id) else {
            self.fail_transfer(
                blob_id,
                TransferError::ClientRestoration(blob.client_restoration_id.clone()),
            );
            return;
        };
        let retry = self.retry.clone();

        let mut ops: Vec<Arc<dyn TransferOperation>> = Vec::new();
        let mut satisfied = Vec::new();
        let mut dependencies = Vec::new();

        match blob.direction {
            TransferDirection::Download if !blob.initial_call_complete => {
                let Some(probe) = blocks.iter().find(|b| b.is_probe()) else {
                    self.fail_transfer(
                        blob_id,
                        TransferError::Decomposition("probe block is missing".into()),
                    );
                    return;
                };
                ops.push(Arc::new(DownloadInitialOperation::new(
                    probe.id.clone(),
                    blob.id.clone(),
                    blob.source.clone(),
                    client,
                    retry,
                )));
            }
            TransferDirection::Download => {
                let partial = partial_path(&blob.destination);
                let expected_len = blocks.iter().map(|b| b.end_range).max().unwrap_or(0);
                for block in &blocks {
                    match block.state {
                        TransferState::Complete => {
                            satisfied.push(block.id.clone());
                            dependencies.push(block.id.clone());
                        }
                        TransferState::Pending => {
                            dependencies.push(block.id.clone());
                            ops.push(Arc::new(DownloadBlockOperation::new(
                                block.id.clone(),
                                blob.id.clone(),
                                blob.source.clone(),
                                block.start_range,
                                block.end_range,
                                partial.clone(),
                                client.clone(),
                                retry.clone(),
                            )));
                        }
                        _ => {}
                    }
                }
                ops.push(Arc::new(DownloadFinalOperation::new(
                    final_unit_id(&blob.id),
                    blob.id.clone(),
                    dependencies,
                    partial,
                    PathBuf::from(&blob.destination),
                    expected_len,
                )));
            }
            TransferDirection::Upload => {
                // Commit order is decomposition order, complete blocks included.
                let block_ids: Vec<String> = blocks.iter().map(|b| b.id.clone()).collect();
                for block in &blocks {
                    match block.state {
                        TransferState::Complete => {
                            satisfied.push(block.id.clone());
                            dependencies.push(block.id.clone());
                        }
                        TransferState::Pending => {
                            dependencies.push(block.id.clone());
                            ops.push(Arc::new(UploadBlockOperation::new(
                                block.id.clone(),
                                blob.id.clone(),
                                blob.destination.clone(),
                                PathBuf::from(&blob.source),
                                block.start_range,
                                block.end_range,
                                client.clone(),
                                retry.clone(),
                            )));
                        }
                        _ => {}
                    }
                }
                ops.push(Arc::new(UploadFinalOperation::new(
                    final_unit_id(&blob.id),
                    blob.id.clone(),
                    dependencies,
                    blob.destination.clone(),
                    block_ids,
                    blob.properties.content_type.clone(),
                    client,
                    retry,
                )));
            }
        }

        for unit_id in satisfied {
            self.queue.mark_satisfied(&unit_id);
        }
        self.queue.add_many(ops);
    }

    fn buffer_blob(&self, blob: &BlobTransfer) {
        if let Err(e) = self.store.upsert_blob(blob) {
            warn!("Failed to buffer transfer update: {}", e);
        }
    }

    fn buffer_block(&self, block: &BlockTransfer) {
        if let Err(e) = self.store.upsert_block(block) {
            warn!("Failed to buffer block update: {}", e);
        }
    }

    /// Flush buffered writes. Persistence failures are logged and retried on
    /// the next save; they never fail a transfer.
    fn persist(&self) {
        if let Err(e) = self.store.save() {
            warn!("Deferred store save failed: {}", e);
        }
    }

    fn emit(&self, notes: Notifications) {
        if notes.is_empty() {
            return;
        }
        let delegate = self.delegate.read().unwrap().clone();
        if let Some(delegate) = delegate {
            for (id, state) in notes {
                delegate.transfer_did_change_state(&id, state);
            }
        }
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("transfers", &self.len())
            .field("session_id", &self.session_id)
            .finish()
    }
}
