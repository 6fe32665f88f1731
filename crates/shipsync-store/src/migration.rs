//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use shipsync_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: replica outbox, mappings, idempotency and dead letters.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Replica outbox
        CREATE TABLE sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ship_id TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_id TEXT NOT NULL,
            operation TEXT NOT NULL,          -- create | update | delete
            local_version INTEGER NOT NULL DEFAULT 0,
            payload TEXT,                     -- JSON, NULL for deletes
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            conflict_id INTEGER,
            created_at INTEGER NOT NULL,
            synced_at INTEGER
        );

        -- Replica id <-> master id, per ship and content type
        CREATE TABLE document_mappings (
            ship_id TEXT NOT NULL,
            content_type TEXT NOT NULL,
            replica_document_id TEXT NOT NULL,
            master_document_id TEXT NOT NULL,
            last_synced_by TEXT NOT NULL,     -- ship | master
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,      -- conflict watermark
            PRIMARY KEY (ship_id, content_type, replica_document_id),
            UNIQUE (ship_id, content_type, master_document_id)
        );

        -- Idempotency gate
        CREATE TABLE processed_messages (
            message_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            processed_at INTEGER NOT NULL
        );

        -- Poison messages
        CREATE TABLE dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            ship_id TEXT,
            content_type TEXT,
            content_id TEXT,
            operation TEXT,
            payload TEXT NOT NULL,
            error_message TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            last_retry_at INTEGER,
            resolved_at INTEGER,
            resolved_by TEXT
        );

        CREATE INDEX idx_sync_queue_claim ON sync_queue(ship_id, status, created_at, id);
        CREATE INDEX idx_sync_queue_conflict ON sync_queue(conflict_id);
        CREATE INDEX idx_processed_at ON processed_messages(processed_at);
        CREATE INDEX idx_dead_letters_status ON dead_letters(status);
        "#,
    )?;

    Ok(())
}

/// Migration v2: master-side state (conflicts, outbound buffer, ship registry).
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE conflict_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_type TEXT NOT NULL,
            content_id TEXT NOT NULL,         -- master document id
            ship_id TEXT NOT NULL,
            ship_data TEXT NOT NULL,
            master_data TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            resolution_strategy TEXT,
            resolution_data TEXT,
            resolved_at INTEGER,
            resolved_by TEXT,
            created_at INTEGER NOT NULL
        );

        -- At most one unresolved conflict per document and ship
        CREATE UNIQUE INDEX idx_conflict_logs_open
            ON conflict_logs(content_type, content_id, ship_id)
            WHERE resolved_at IS NULL;

        CREATE TABLE outbound_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            message_key TEXT NOT NULL,
            message TEXT NOT NULL,            -- encoded envelope
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            sent_at INTEGER
        );

        CREATE TABLE ship_registry (
            ship_id TEXT PRIMARY KEY,
            ship_name TEXT NOT NULL,
            connectivity_status TEXT NOT NULL,
            last_seen_at INTEGER NOT NULL
        );

        CREATE INDEX idx_outbound_status ON outbound_queue(status, id);
        "#,
    )?;

    Ok(())
}
