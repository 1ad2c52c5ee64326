//! Transfer progress storage and persistence.
//!
//! Provides SQLite-backed storage for transfer records. Writes are buffered
//! in memory and flushed atomically by [`TransferStore::save`]; reads see
//! the last saved state. The connection mutex is the single serialization
//! context all persistence goes through.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::error::TransferErrorKind;
use super::models::{
    BlobTransfer, BlockTransfer, MultiBlobTransfer, TransferDirection, TransferProperties,
    TransferState,
};
use super::schema::TRANSFER_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;

/// Meta key holding the HTTP session identifier, stable across launches.
pub const META_SESSION_ID: &str = "http_session_id";

/// Trait for transfer progress storage.
///
/// Mutations buffer until `save()` flushes them in one transaction. When the
/// same record is written more than once between saves, the last write wins.
/// Fetches return the last saved state and are intended for startup
/// hydration.
pub trait TransferStore: Send + Sync {
    /// Insert or update a blob record.
    fn upsert_blob(&self, blob: &BlobTransfer) -> Result<()>;

    /// Insert or update a block record.
    fn upsert_block(&self, block: &BlockTransfer) -> Result<()>;

    /// Insert or update a group record.
    fn upsert_group(&self, group: &MultiBlobTransfer) -> Result<()>;

    /// Delete a blob record; its blocks are cascade-deleted.
    fn delete_blob(&self, id: &str) -> Result<()>;

    /// Delete a single block record.
    fn delete_block(&self, id: &str) -> Result<()>;

    /// Delete a group record; member blobs and their blocks cascade.
    fn delete_group(&self, id: &str) -> Result<()>;

    /// Blob records with no owning group.
    fn fetch_root_blobs(&self) -> Result<Vec<BlobTransfer>>;

    /// Block records with no parent blob.
    fn fetch_root_blocks(&self) -> Result<Vec<BlockTransfer>>;

    fn fetch_groups(&self) -> Result<Vec<MultiBlobTransfer>>;

    /// Blocks of one blob, in decomposition order.
    fn fetch_blocks(&self, parent_id: &str) -> Result<Vec<BlockTransfer>>;

    fn fetch_group_members(&self, group_id: &str) -> Result<Vec<BlobTransfer>>;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically flush all buffered writes. On failure the buffer is kept
    /// and flushed on the next call.
    fn save(&self) -> Result<()>;
}

/// Process-wide registry of open store paths. A store path may be owned by
/// at most one live [`SqliteTransferStore`]; a second open fails.
static OPEN_STORE_PATHS: Mutex<Option<HashSet<PathBuf>>> = Mutex::new(None);

fn register_store_path(path: &Path) -> Result<PathBuf> {
    let resolved = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => match parent.canonicalize() {
            Ok(dir) => dir.join(path.file_name().unwrap_or_default()),
            Err(_) => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    };

    let mut registry = OPEN_STORE_PATHS.lock().unwrap();
    let paths = registry.get_or_insert_with(HashSet::new);
    if !paths.insert(resolved.clone()) {
        bail!(
            "Transfer store {:?} is already owned by another manager",
            resolved
        );
    }
    Ok(resolved)
}

fn release_store_path(path: &Path) {
    let mut registry = OPEN_STORE_PATHS.lock().unwrap();
    if let Some(paths) = registry.as_mut() {
        paths.remove(path);
    }
}

#[derive(Debug)]
enum PendingWrite {
    UpsertBlob(BlobTransfer),
    UpsertBlock(BlockTransfer),
    UpsertGroup(MultiBlobTransfer),
    DeleteBlob(String),
    DeleteBlock(String),
    DeleteGroup(String),
    SetMeta(String, String),
}

impl PendingWrite {
    fn apply(&self, conn: &Connection) -> Result<()> {
        match self {
            PendingWrite::UpsertBlob(blob) => {
                let properties = serde_json::to_string(&blob.properties)
                    .context("Failed to serialize transfer properties")?;
                conn.execute(
                    r#"INSERT INTO blob_transfers (
                        id, direction, source, destination, client_restoration_id,
                        properties, state, total_blocks, initial_call_complete,
                        error_kind, error_message, group_id, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(id) DO UPDATE SET
                        direction = excluded.direction,
                        source = excluded.source,
                        destination = excluded.destination,
                        client_restoration_id = excluded.client_restoration_id,
                        properties = excluded.properties,
                        state = excluded.state,
                        total_blocks = excluded.total_blocks,
                        initial_call_complete = excluded.initial_call_complete,
                        error_kind = excluded.error_kind,
                        error_message = excluded.error_message,
                        group_id = excluded.group_id"#,
                    params![
                        blob.id,
                        blob.direction.as_str(),
                        blob.source,
                        blob.destination,
                        blob.client_restoration_id,
                        properties,
                        blob.state.as_db_str(),
                        blob.total_blocks as i64,
                        blob.initial_call_complete,
                        blob.error_kind.as_ref().map(|k| k.as_str()),
                        blob.error_message,
                        blob.group_id,
                        blob.created_at,
                    ],
                )?;
            }
            PendingWrite::UpsertBlock(block) => {
                conn.execute(
                    r#"INSERT INTO block_transfers (
                        id, parent_id, start_range, end_range, ordinal, state
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(id) DO UPDATE SET
                        parent_id = excluded.parent_id,
                        start_range = excluded.start_range,
                        end_range = excluded.end_range,
                        ordinal = excluded.ordinal,
                        state = excluded.state"#,
                    params![
                        block.id,
                        block.parent_id,
                        block.start_range as i64,
                        block.end_range as i64,
                        block.ordinal as i64,
                        block.state.as_db_str(),
                    ],
                )?;
            }
            PendingWrite::UpsertGroup(group) => {
                conn.execute(
                    r#"INSERT INTO multi_blob_transfers (id, state, created_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(id) DO UPDATE SET state = excluded.state"#,
                    params![group.id, group.state.as_db_str(), group.created_at],
                )?;
            }
            PendingWrite::DeleteBlob(id) => {
                conn.execute("DELETE FROM blob_transfers WHERE id = ?1", params![id])?;
            }
            PendingWrite::DeleteBlock(id) => {
                conn.execute("DELETE FROM block_transfers WHERE id = ?1", params![id])?;
            }
            PendingWrite::DeleteGroup(id) => {
                conn.execute(
                    "DELETE FROM multi_blob_transfers WHERE id = ?1",
                    params![id],
                )?;
            }
            PendingWrite::SetMeta(key, value) => {
                conn.execute(
                    r#"INSERT INTO transfer_meta (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
                    params![key, value],
                )?;
            }
        }
        Ok(())
    }
}

/// SQLite-backed transfer store.
#[derive(Debug)]
pub struct SqliteTransferStore {
    conn: Arc<Mutex<Connection>>,
    pending: Mutex<Vec<PendingWrite>>,
    registered_path: Option<PathBuf>,
}

impl SqliteTransferStore {
    /// Open an existing store or create a new one with the current schema.
    ///
    /// Fails if the path is already owned by another live store in this
    /// process, or if the file cannot be opened or validated.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let registered_path = register_store_path(db_path.as_ref())?;
        let conn = match open_versioned(&db_path, TRANSFER_VERSIONED_SCHEMAS) {
            Ok(conn) => conn,
            Err(e) => {
                release_store_path(&registered_path);
                return Err(e);
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Mutex::new(Vec::new()),
            registered_path: Some(registered_path),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(TRANSFER_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Mutex::new(Vec::new()),
            registered_path: None,
        })
    }

    fn buffer(&self, write: PendingWrite) {
        self.pending.lock().unwrap().push(write);
    }

    fn row_to_blob(row: &rusqlite::Row) -> rusqlite::Result<BlobTransfer> {
        let properties: TransferProperties = row
            .get::<_, String>("properties")
            .map(|s| serde_json::from_str(&s).unwrap_or_default())?;
        Ok(BlobTransfer {
            id: row.get("id")?,
            direction: TransferDirection::from_str(&row.get::<_, String>("direction")?)
                .unwrap_or(TransferDirection::Download),
            source: row.get("source")?,
            destination: row.get("destination")?,
            client_restoration_id: row.get("client_restoration_id")?,
            properties,
            state: TransferState::from_db_str(&row.get::<_, String>("state")?),
            total_blocks: row.get::<_, i64>("total_blocks")? as u32,
            initial_call_complete: row.get("initial_call_complete")?,
            error_kind: row
                .get::<_, Option<String>>("error_kind")?
                .and_then(|s| TransferErrorKind::from_str(&s)),
            error_message: row.get("error_message")?,
            group_id: row.get("group_id")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<BlockTransfer> {
        Ok(BlockTransfer {
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            start_range: row.get::<_, i64>("start_range")? as u64,
            end_range: row.get::<_, i64>("end_range")? as u64,
            ordinal: row.get::<_, i64>("ordinal")? as u32,
            state: TransferState::from_db_str(&row.get::<_, String>("state")?),
        })
    }

    fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<MultiBlobTransfer> {
        Ok(MultiBlobTransfer {
            id: row.get("id")?,
            state: TransferState::from_db_str(&row.get::<_, String>("state")?),
            created_at: row.get("created_at")?,
        })
    }
}

impl Drop for SqliteTransferStore {
    fn drop(&mut self) {
        if let Some(path) = self.registered_path.take() {
            release_store_path(&path);
        }
    }
}

impl TransferStore for SqliteTransferStore {
    fn upsert_blob(&self, blob: &BlobTransfer) -> Result<()> {
        self.buffer(PendingWrite::UpsertBlob(blob.clone()));
        Ok(())
    }

    fn upsert_block(&self, block: &BlockTransfer) -> Result<()> {
        self.buffer(PendingWrite::UpsertBlock(block.clone()));
        Ok(())
    }

    fn upsert_group(&self, group: &MultiBlobTransfer) -> Result<()> {
        self.buffer(PendingWrite::UpsertGroup(group.clone()));
        Ok(())
    }

    fn delete_blob(&self, id: &str) -> Result<()> {
        self.buffer(PendingWrite::DeleteBlob(id.to_string()));
        Ok(())
    }

    fn delete_block(&self, id: &str) -> Result<()> {
        self.buffer(PendingWrite::DeleteBlock(id.to_string()));
        Ok(())
    }

    fn delete_group(&self, id: &str) -> Result<()> {
        self.buffer(PendingWrite::DeleteGroup(id.to_string()));
        Ok(())
    }

    fn fetch_root_blobs(&self) -> Result<Vec<BlobTransfer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM blob_transfers WHERE group_id IS NULL ORDER BY created_at, id",
        )?;
        let blobs = stmt
            .query_map([], Self::row_to_blob)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blobs)
    }

    fn fetch_root_blocks(&self) -> Result<Vec<BlockTransfer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM block_transfers WHERE parent_id IS NULL ORDER BY id")?;
        let blocks = stmt
            .query_map([], Self::row_to_block)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    fn fetch_groups(&self) -> Result<Vec<MultiBlobTransfer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM multi_blob_transfers ORDER BY created_at, id")?;
        let groups = stmt
            .query_map([], Self::row_to_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    fn fetch_blocks(&self, parent_id: &str) -> Result<Vec<BlockTransfer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM block_transfers WHERE parent_id = ?1 ORDER BY ordinal")?;
        let blocks = stmt
            .query_map([parent_id], Self::row_to_block)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    fn fetch_group_members(&self, group_id: &str) -> Result<Vec<BlobTransfer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM blob_transfers WHERE group_id = ?1 ORDER BY created_at, id")?;
        let blobs = stmt
            .query_map([group_id], Self::row_to_blob)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blobs)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM transfer_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.buffer(PendingWrite::SetMeta(key.to_string(), value.to_string()));
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let result = (|| -> Result<()> {
            let tx = conn.transaction()?;
            for write in pending.iter() {
                write.apply(&tx)?;
            }
            tx.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                pending.clear();
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to flush {} pending writes, will retry on next save: {}",
                    pending.len(),
                    e
                );
                Err(e)
            }
        }
    }
}
