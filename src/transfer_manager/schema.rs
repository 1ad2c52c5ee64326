//! Database schema for the transfer progress store.

use crate::sqlite_persistence::VersionedSchema;

pub const TRANSFER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    up: r#"
        CREATE TABLE blob_transfers (
            id TEXT PRIMARY KEY,
            direction TEXT NOT NULL,
            source TEXT NOT NULL,
            destination TEXT NOT NULL,
            client_restoration_id TEXT NOT NULL,
            properties TEXT NOT NULL,
            state TEXT NOT NULL,
            total_blocks INTEGER NOT NULL DEFAULT 0,
            initial_call_complete INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error_message TEXT,
            group_id TEXT REFERENCES multi_blob_transfers(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE block_transfers (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES blob_transfers(id) ON DELETE CASCADE,
            start_range INTEGER NOT NULL,
            end_range INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            state TEXT NOT NULL
        );

        CREATE TABLE multi_blob_transfers (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE transfer_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX idx_block_transfers_parent ON block_transfers(parent_id);
        CREATE INDEX idx_blob_transfers_group ON blob_transfers(group_id);
    "#,
    tables: &[
        "blob_transfers",
        "block_transfers",
        "multi_blob_transfers",
        "transfer_meta",
    ],
    migration: None,
}];
