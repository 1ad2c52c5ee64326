//! Shared SQLite persistence helpers.
//!
//! Databases carry their schema version in `PRAGMA user_version`, offset by
//! [`BASE_DB_VERSION`] so that a foreign SQLite file (user_version 0 or some
//! unrelated number) is rejected instead of being silently migrated.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

/// Offset added to schema versions before they are written to
/// `PRAGMA user_version`.
pub const BASE_DB_VERSION: usize = 84000;

/// One version of a database schema.
///
/// `up` is the full DDL for a fresh database at this version. `migration`
/// transforms a database at the previous version to this one; the first
/// schema in a series has no migration.
pub struct VersionedSchema {
    pub version: usize,
    pub up: &'static str,
    /// Table names expected to exist at this version, used for validation.
    pub tables: &'static [&'static str],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    /// Create all tables for this version on a fresh connection.
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        conn.execute_batch(self.up)
            .context("Failed to create schema")?;
        conn.pragma_update(None, "user_version", (BASE_DB_VERSION + self.version) as i64)?;
        Ok(())
    }

    /// Check that every table this version declares actually exists.
    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Database is missing table '{}'", table);
            }
        }
        Ok(())
    }
}

/// Open (or create) a versioned database at `db_path`.
///
/// A new file is created at the latest schema version. An existing file is
/// validated against its recorded version and migrated forward if needed.
/// Version numbers outside the known range are fatal.
pub fn open_versioned<P: AsRef<Path>>(
    db_path: P,
    schemas: &[VersionedSchema],
) -> Result<Connection> {
    let latest = schemas.last().context("No schemas defined")?;

    if !db_path.as_ref().exists() {
        let conn = Connection::open(&db_path)?;
        latest.create(&conn)?;
        info!("Created new database at {:?}", db_path.as_ref());
        return Ok(conn);
    }

    let conn = Connection::open(&db_path)?;
    conn.execute("PRAGMA foreign_keys = ON;", [])?;

    let raw_version: i64 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("Failed to read database version")?;
    let version = raw_version - BASE_DB_VERSION as i64;

    if version < 0 {
        bail!(
            "Database version {} does not contain base version {}",
            raw_version,
            BASE_DB_VERSION
        );
    }
    let version = version as usize;
    if version >= schemas.len() {
        bail!(
            "Database version {} is too new (max supported: {})",
            version,
            schemas.len() - 1
        );
    }

    schemas
        .get(version)
        .context("Failed to get schema")?
        .validate(&conn)?;

    migrate_if_needed(&conn, schemas, version)?;
    Ok(conn)
}

/// Create an in-memory database at the latest schema version.
pub fn open_in_memory(schemas: &[VersionedSchema]) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schemas
        .last()
        .context("No schemas defined")?
        .create(&conn)?;
    Ok(conn)
}

fn migrate_if_needed(
    conn: &Connection,
    schemas: &[VersionedSchema],
    current_version: usize,
) -> Result<()> {
    let target_version = schemas.len() - 1;
    if current_version >= target_version {
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, target_version
    );
    for schema in schemas.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!("Running migration to version {}", schema.version);
            migration_fn(conn)?;
        }
    }
    conn.pragma_update(None, "user_version", (BASE_DB_VERSION + target_version) as i64)?;
    Ok(())
}
