//! SQLite implementation of the Store trait.
//!
//! This is the durable backend: the outbox survives process restarts. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use shipsync_core::{
    now_millis, ConflictLog, ConflictResolution, ConflictType, ConnectivityStatus, ContentType,
    DeadLetterEntry, DeadLetterStatus, DocumentId, DocumentMapping, MessageId, NewConflict,
    NewDeadLetter, NewQueueEntry, Operation, OutboundEntry, OutboundStatus, ProcessedMessage,
    ProcessedStatus, QueueStatus, ResolutionStrategy, ShipId, ShipRecord, SyncQueueEntry,
    SyncedBy, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Store;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn conversion_error(
    idx: usize,
    ty: Type,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn opt_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| {
        conversion_error(
            idx,
            Type::Text,
            StoreError::InvalidData(format!("unexpected value '{}'", text)),
        )
    })
}

fn opt_enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(t) => parse(&t).map(Some).ok_or_else(|| {
            conversion_error(
                idx,
                Type::Text,
                StoreError::InvalidData(format!("unexpected value '{}'", t)),
            )
        }),
    }
}

fn to_json_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

const QUEUE_COLUMNS: &str = "id, ship_id, content_type, content_id, operation, local_version,
    payload, status, error_message, retry_count, conflict_id, created_at, synced_at";

fn row_to_queue_entry(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        id: row.get(0)?,
        ship_id: ShipId::new(row.get::<_, String>(1)?),
        content_type: ContentType::new(row.get::<_, String>(2)?),
        content_id: DocumentId::new(row.get::<_, String>(3)?),
        operation: enum_column(row, 4, Operation::parse)?,
        local_version: row.get(5)?,
        payload: opt_json_column(row, 6)?,
        status: enum_column(row, 7, QueueStatus::parse)?,
        error_message: row.get(8)?,
        retry_count: row.get(9)?,
        conflict_id: row.get(10)?,
        created_at: row.get(11)?,
        synced_at: row.get(12)?,
    })
}

const OUTBOUND_COLUMNS: &str =
    "id, topic, message_key, message, status, retry_count, error_message, created_at, sent_at";

fn row_to_outbound(row: &Row<'_>) -> rusqlite::Result<OutboundEntry> {
    Ok(OutboundEntry {
        id: row.get(0)?,
        topic: row.get(1)?,
        key: row.get(2)?,
        message: json_column(row, 3)?,
        status: enum_column(row, 4, OutboundStatus::parse)?,
        retry_count: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
        sent_at: row.get(8)?,
    })
}

const MAPPING_COLUMNS: &str = "ship_id, content_type, replica_document_id, master_document_id,
    last_synced_by, created_at, updated_at";

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<DocumentMapping> {
    Ok(DocumentMapping {
        ship_id: ShipId::new(row.get::<_, String>(0)?),
        content_type: ContentType::new(row.get::<_, String>(1)?),
        replica_document_id: DocumentId::new(row.get::<_, String>(2)?),
        master_document_id: DocumentId::new(row.get::<_, String>(3)?),
        last_synced_by: enum_column(row, 4, SyncedBy::parse)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const CONFLICT_COLUMNS: &str = "id, content_type, content_id, ship_id, ship_data, master_data,
    conflict_type, resolution_strategy, resolution_data, resolved_at, resolved_by, created_at";

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictLog> {
    Ok(ConflictLog {
        id: row.get(0)?,
        content_type: ContentType::new(row.get::<_, String>(1)?),
        content_id: DocumentId::new(row.get::<_, String>(2)?),
        ship_id: ShipId::new(row.get::<_, String>(3)?),
        ship_data: json_column(row, 4)?,
        master_data: json_column(row, 5)?,
        conflict_type: enum_column(row, 6, ConflictType::parse)?,
        resolution_strategy: opt_enum_column(row, 7, ResolutionStrategy::parse)?,
        resolution_data: opt_json_column(row, 8)?,
        resolved_at: row.get(9)?,
        resolved_by: row.get(10)?,
        created_at: row.get(11)?,
    })
}

const DEAD_LETTER_COLUMNS: &str = "id, message_id, ship_id, content_type, content_id, operation,
    payload, error_message, retry_count, max_retries, status, created_at, last_retry_at,
    resolved_at, resolved_by";

fn row_to_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        id: row.get(0)?,
        message_id: MessageId::new(row.get::<_, String>(1)?),
        ship_id: row.get::<_, Option<String>>(2)?.map(ShipId::new),
        content_type: row.get::<_, Option<String>>(3)?.map(ContentType::new),
        content_id: row.get::<_, Option<String>>(4)?.map(DocumentId::new),
        operation: opt_enum_column(row, 5, Operation::parse)?,
        payload: json_column(row, 6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        status: enum_column(row, 10, DeadLetterStatus::parse)?,
        created_at: row.get(11)?,
        last_retry_at: row.get(12)?,
        resolved_at: row.get(13)?,
        resolved_by: row.get(14)?,
    })
}

fn row_to_ship(row: &Row<'_>) -> rusqlite::Result<ShipRecord> {
    Ok(ShipRecord {
        ship_id: ShipId::new(row.get::<_, String>(0)?),
        ship_name: row.get(1)?,
        connectivity_status: enum_column(row, 2, ConnectivityStatus::parse)?,
        last_seen_at: row.get(3)?,
    })
}

fn fetch_queue_entry(conn: &Connection, id: i64) -> Result<Option<SyncQueueEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_queue WHERE id = ?1", QUEUE_COLUMNS),
        params![id],
        row_to_queue_entry,
    )
    .optional()
    .map_err(StoreError::from)
}

fn fetch_mapping(
    conn: &Connection,
    ship_id: &str,
    content_type: &str,
    replica_document_id: &str,
) -> Result<Option<DocumentMapping>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM document_mappings
             WHERE ship_id = ?1 AND content_type = ?2 AND replica_document_id = ?3",
            MAPPING_COLUMNS
        ),
        params![ship_id, content_type, replica_document_id],
        row_to_mapping,
    )
    .optional()
    .map_err(StoreError::from)
}

fn fetch_conflict(conn: &Connection, id: i64) -> Result<Option<ConflictLog>> {
    conn.query_row(
        &format!("SELECT {} FROM conflict_logs WHERE id = ?1", CONFLICT_COLUMNS),
        params![id],
        row_to_conflict,
    )
    .optional()
    .map_err(StoreError::from)
}

fn fetch_dead_letter(conn: &Connection, id: i64) -> Result<Option<DeadLetterEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM dead_letters WHERE id = ?1", DEAD_LETTER_COLUMNS),
        params![id],
        row_to_dead_letter,
    )
    .optional()
    .map_err(StoreError::from)
}

fn fetch_ship(conn: &Connection, ship_id: &str) -> Result<Option<ShipRecord>> {
    conn.query_row(
        "SELECT ship_id, ship_name, connectivity_status, last_seen_at
         FROM ship_registry WHERE ship_id = ?1",
        params![ship_id],
        row_to_ship,
    )
    .optional()
    .map_err(StoreError::from)
}

#[async_trait]
impl Store for SqliteStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Sync Queue
    // ─────────────────────────────────────────────────────────────────────────

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<SyncQueueEntry> {
        let payload = entry.payload.as_ref().map(to_json_text).transpose()?;

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sync_queue (
                    ship_id, content_type, content_id, operation, local_version,
                    payload, status, retry_count, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)",
                params![
                    entry.ship_id.as_str(),
                    entry.content_type.as_str(),
                    entry.content_id.as_str(),
                    entry.operation.as_str(),
                    entry.local_version,
                    payload,
                    now_millis(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            fetch_queue_entry(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("sync queue entry {}", id)))
        })
        .await
    }

    async fn dequeue(&self, ship_id: &ShipId, limit: usize) -> Result<Vec<SyncQueueEntry>> {
        let ship_id = ship_id.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;

            let mut entries = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM sync_queue
                     WHERE ship_id = ?1 AND status = 'pending'
                     ORDER BY created_at, id
                     LIMIT ?2",
                    QUEUE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![ship_id.as_str(), limit as i64], row_to_queue_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            for entry in &mut entries {
                tx.execute(
                    "UPDATE sync_queue SET status = 'syncing' WHERE id = ?1",
                    params![entry.id],
                )?;
                entry.status = QueueStatus::Syncing;
            }

            tx.commit()?;
            Ok(entries)
        })
        .await
    }

    async fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        self.call(move |conn| fetch_queue_entry(conn, id)).await
    }

    async fn list_queue(
        &self,
        ship_id: &ShipId,
        status: Option<QueueStatus>,
    ) -> Result<Vec<SyncQueueEntry>> {
        let ship_id = ship_id.clone();

        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sync_queue
                 WHERE ship_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at, id",
                QUEUE_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![ship_id.as_str(), status.map(|s| s.as_str())],
                    row_to_queue_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn mark_synced(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET status = 'synced', synced_at = ?2, error_message = NULL
                 WHERE id = ?1",
                params![id, now_millis()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("sync queue entry {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: i64, error: &str, max_retries: u32) -> Result<QueueStatus> {
        let error = error.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1,
                     error_message = ?2,
                     status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END
                 WHERE id = ?1",
                params![id, error, max_retries],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("sync queue entry {}", id)));
            }
            let status: String = conn.query_row(
                "SELECT status FROM sync_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            QueueStatus::parse(&status)
                .ok_or_else(|| StoreError::InvalidData(format!("queue status '{}'", status)))
        })
        .await
    }

    async fn release(&self, ids: &[i64]) -> Result<()> {
        let ids = ids.to_vec();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE sync_queue SET status = 'pending' WHERE id = ?1 AND status = 'syncing'",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_conflict_pending(&self, id: i64, conflict_id: i64, reason: &str) -> Result<()> {
        let reason = reason.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue
                 SET status = 'conflict_pending', conflict_id = ?2, error_message = ?3
                 WHERE id = ?1",
                params![id, conflict_id, reason],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("sync queue entry {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn mark_conflict_outcome(
        &self,
        conflict_id: i64,
        status: QueueStatus,
    ) -> Result<usize> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET status = ?2, synced_at = ?3
                 WHERE conflict_id = ?1 AND status = 'conflict_pending'",
                params![conflict_id, status.as_str(), now_millis()],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn supersede_pending(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        content_id: &DocumentId,
        reason: &str,
    ) -> Result<usize> {
        let ship_id = ship_id.clone();
        let content_type = content_type.clone();
        let content_id = content_id.clone();
        let reason = reason.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue
                 SET status = 'conflict_rejected', error_message = ?4, synced_at = ?5
                 WHERE ship_id = ?1 AND content_type = ?2 AND content_id = ?3
                   AND status = 'pending'",
                params![
                    ship_id.as_str(),
                    content_type.as_str(),
                    content_id.as_str(),
                    reason,
                    now_millis()
                ],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn requeue_in_flight(&self, ship_id: &ShipId) -> Result<usize> {
        let ship_id = ship_id.clone();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET status = 'pending'
                 WHERE ship_id = ?1 AND status = 'syncing'",
                params![ship_id.as_str()],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn pending_count(&self, ship_id: &ShipId) -> Result<usize> {
        let ship_id = ship_id.clone();

        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE ship_id = ?1 AND status = 'pending'",
                params![ship_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn cleanup_synced(&self, before: Timestamp) -> Result<usize> {
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM sync_queue WHERE status = 'synced' AND created_at < ?1",
                params![before],
            )?;
            Ok(deleted)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Master Outbound Queue
    // ─────────────────────────────────────────────────────────────────────────

    async fn outbound_enqueue(
        &self,
        topic: &str,
        key: &str,
        message: &Value,
    ) -> Result<OutboundEntry> {
        let topic = topic.to_string();
        let key = key.to_string();
        let message = to_json_text(message)?;

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO outbound_queue (topic, message_key, message, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![topic, key, message, now_millis()],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM outbound_queue WHERE id = ?1", OUTBOUND_COLUMNS),
                params![id],
                row_to_outbound,
            )
            .map_err(StoreError::from)
        })
        .await
    }

    async fn outbound_pending(&self, limit: usize) -> Result<Vec<OutboundEntry>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM outbound_queue WHERE status = 'pending' ORDER BY id LIMIT ?1",
                OUTBOUND_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![limit as i64], row_to_outbound)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn outbound_mark_sent(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE outbound_queue SET status = 'sent', sent_at = ?2 WHERE id = ?1",
                params![id, now_millis()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("outbound entry {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn outbound_mark_failed(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboundStatus> {
        let error = error.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE outbound_queue
                 SET retry_count = retry_count + 1,
                     error_message = ?2,
                     status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END
                 WHERE id = ?1",
                params![id, error, max_retries],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("outbound entry {}", id)));
            }
            let status: String = conn.query_row(
                "SELECT status FROM outbound_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            OutboundStatus::parse(&status)
                .ok_or_else(|| StoreError::InvalidData(format!("outbound status '{}'", status)))
        })
        .await
    }

    async fn outbound_count(&self) -> Result<usize> {
        self.call(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbound_queue WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Document Mapping
    // ─────────────────────────────────────────────────────────────────────────

    async fn set_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
        master_document_id: &DocumentId,
        synced_by: SyncedBy,
        at: Timestamp,
    ) -> Result<DocumentMapping> {
        let ship_id = ship_id.clone();
        let content_type = content_type.clone();
        let replica_id = replica_document_id.clone();
        let master_id = master_document_id.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;

            // Re-point a master id that was mapped to another replica document.
            tx.execute(
                "DELETE FROM document_mappings
                 WHERE ship_id = ?1 AND content_type = ?2 AND master_document_id = ?3
                   AND replica_document_id != ?4",
                params![
                    ship_id.as_str(),
                    content_type.as_str(),
                    master_id.as_str(),
                    replica_id.as_str()
                ],
            )?;

            tx.execute(
                "INSERT INTO document_mappings (
                    ship_id, content_type, replica_document_id, master_document_id,
                    last_synced_by, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT (ship_id, content_type, replica_document_id) DO UPDATE SET
                    master_document_id = excluded.master_document_id,
                    last_synced_by = excluded.last_synced_by,
                    updated_at = MAX(document_mappings.updated_at, excluded.updated_at)",
                params![
                    ship_id.as_str(),
                    content_type.as_str(),
                    replica_id.as_str(),
                    master_id.as_str(),
                    synced_by.as_str(),
                    at,
                ],
            )?;

            let mapping = fetch_mapping(
                &tx,
                ship_id.as_str(),
                content_type.as_str(),
                replica_id.as_str(),
            )?
            .ok_or_else(|| StoreError::NotFound(format!("mapping {}", replica_id)))?;

            tx.commit()?;
            Ok(mapping)
        })
        .await
    }

    async fn get_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>> {
        let ship_id = ship_id.clone();
        let content_type = content_type.clone();
        let replica_id = replica_document_id.clone();

        self.call(move |conn| {
            fetch_mapping(conn, ship_id.as_str(), content_type.as_str(), replica_id.as_str())
        })
        .await
    }

    async fn find_by_master_id(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>> {
        let ship_id = ship_id.clone();
        let content_type = content_type.clone();
        let master_id = master_document_id.clone();

        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM document_mappings
                     WHERE ship_id = ?1 AND content_type = ?2 AND master_document_id = ?3",
                    MAPPING_COLUMNS
                ),
                params![ship_id.as_str(), content_type.as_str(), master_id.as_str()],
                row_to_mapping,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn delete_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<bool> {
        let ship_id = ship_id.clone();
        let content_type = content_type.clone();
        let replica_id = replica_document_id.clone();

        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM document_mappings
                 WHERE ship_id = ?1 AND content_type = ?2 AND replica_document_id = ?3",
                params![ship_id.as_str(), content_type.as_str(), replica_id.as_str()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn delete_mappings_for_master(
        &self,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<usize> {
        let content_type = content_type.clone();
        let master_id = master_document_id.clone();

        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM document_mappings
                 WHERE content_type = ?1 AND master_document_id = ?2",
                params![content_type.as_str(), master_id.as_str()],
            )?;
            Ok(deleted)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processed Messages
    // ─────────────────────────────────────────────────────────────────────────

    async fn record_processed(
        &self,
        message_id: &MessageId,
        status: ProcessedStatus,
        at: Timestamp,
    ) -> Result<bool> {
        let message_id = message_id.clone();

        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, status, processed_at)
                 VALUES (?1, ?2, ?3)",
                params![message_id.as_str(), status.as_str(), at],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn get_processed(&self, message_id: &MessageId) -> Result<Option<ProcessedMessage>> {
        let message_id = message_id.clone();

        self.call(move |conn| {
            conn.query_row(
                "SELECT message_id, status, processed_at FROM processed_messages
                 WHERE message_id = ?1",
                params![message_id.as_str()],
                |row| {
                    Ok(ProcessedMessage {
                        message_id: MessageId::new(row.get::<_, String>(0)?),
                        status: enum_column(row, 1, ProcessedStatus::parse)?,
                        processed_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn update_processed(
        &self,
        message_id: &MessageId,
        status: ProcessedStatus,
    ) -> Result<()> {
        let message_id = message_id.clone();

        self.call(move |conn| {
            conn.execute(
                "UPDATE processed_messages SET status = ?2 WHERE message_id = ?1",
                params![message_id.as_str(), status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_processed(&self, before: Timestamp) -> Result<usize> {
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM processed_messages WHERE processed_at < ?1",
                params![before],
            )?;
            Ok(deleted)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────────

    async fn upsert_conflict(&self, conflict: NewConflict, at: Timestamp) -> Result<ConflictLog> {
        let ship_data = to_json_text(&conflict.ship_data)?;
        let master_data = to_json_text(&conflict.master_data)?;

        self.call(move |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO conflict_logs (
                    content_type, content_id, ship_id, ship_data, master_data,
                    conflict_type, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (content_type, content_id, ship_id) WHERE resolved_at IS NULL
                DO UPDATE SET
                    ship_data = excluded.ship_data,
                    master_data = excluded.master_data,
                    conflict_type = excluded.conflict_type",
                params![
                    conflict.content_type.as_str(),
                    conflict.content_id.as_str(),
                    conflict.ship_id.as_str(),
                    ship_data,
                    master_data,
                    conflict.conflict_type.as_str(),
                    at,
                ],
            )?;

            let log = tx.query_row(
                &format!(
                    "SELECT {} FROM conflict_logs
                     WHERE content_type = ?1 AND content_id = ?2 AND ship_id = ?3
                       AND resolved_at IS NULL",
                    CONFLICT_COLUMNS
                ),
                params![
                    conflict.content_type.as_str(),
                    conflict.content_id.as_str(),
                    conflict.ship_id.as_str()
                ],
                row_to_conflict,
            )?;

            tx.commit()?;
            Ok(log)
        })
        .await
    }

    async fn get_conflict(&self, id: i64) -> Result<Option<ConflictLog>> {
        self.call(move |conn| fetch_conflict(conn, id)).await
    }

    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictLog>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conflict_logs
                 WHERE (?1 = 0 OR resolved_at IS NULL)
                 ORDER BY created_at DESC, id DESC",
                CONFLICT_COLUMNS
            ))?;
            let logs = stmt
                .query_map(params![unresolved_only], row_to_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
        .await
    }

    async fn resolve_conflict(
        &self,
        id: i64,
        resolution: &ConflictResolution,
        at: Timestamp,
    ) -> Result<ConflictLog> {
        let strategy = resolution.strategy;
        let data = resolution.data.as_ref().map(to_json_text).transpose()?;
        let resolved_by = resolution.resolved_by.clone();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE conflict_logs
                 SET resolution_strategy = ?2, resolution_data = ?3,
                     resolved_at = ?4, resolved_by = ?5
                 WHERE id = ?1 AND resolved_at IS NULL",
                params![id, strategy.as_str(), data, at, resolved_by],
            )?;

            let log = fetch_conflict(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("conflict {}", id)))?;
            if changed == 0 {
                return Err(StoreError::AlreadyResolved(id));
            }
            Ok(log)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dead Letters
    // ─────────────────────────────────────────────────────────────────────────

    async fn add_dead_letter(
        &self,
        entry: NewDeadLetter,
        at: Timestamp,
    ) -> Result<DeadLetterEntry> {
        let payload = to_json_text(&entry.payload)?;

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO dead_letters (
                    message_id, ship_id, content_type, content_id, operation,
                    payload, error_message, retry_count, max_retries, status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 'pending', ?9)
                ON CONFLICT (message_id) DO UPDATE SET
                    error_message = excluded.error_message",
                params![
                    entry.message_id.as_str(),
                    entry.ship_id.as_ref().map(|s| s.as_str()),
                    entry.content_type.as_ref().map(|c| c.as_str()),
                    entry.content_id.as_ref().map(|c| c.as_str()),
                    entry.operation.map(|o| o.as_str()),
                    payload,
                    entry.error_message,
                    entry.max_retries,
                    at,
                ],
            )?;

            conn.query_row(
                &format!(
                    "SELECT {} FROM dead_letters WHERE message_id = ?1",
                    DEAD_LETTER_COLUMNS
                ),
                params![entry.message_id.as_str()],
                row_to_dead_letter,
            )
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_dead_letter(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        self.call(move |conn| fetch_dead_letter(conn, id)).await
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM dead_letters
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at, id
                 LIMIT ?2",
                DEAD_LETTER_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), limit as i64],
                    row_to_dead_letter,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM dead_letters
                 WHERE status IN ('pending', 'retrying')
                 ORDER BY created_at, id
                 LIMIT ?1",
                DEAD_LETTER_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![limit as i64], row_to_dead_letter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn mark_dead_letter_retrying(&self, id: i64, at: Timestamp) -> Result<DeadLetterEntry> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE dead_letters
                 SET retry_count = retry_count + 1,
                     last_retry_at = ?2,
                     status = CASE WHEN retry_count + 1 >= max_retries
                                   THEN 'exhausted' ELSE 'retrying' END
                 WHERE id = ?1 AND status IN ('pending', 'retrying')",
                params![id, at],
            )?;
            let entry = fetch_dead_letter(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", id)))?;
            if changed == 0 {
                tracing::debug!(id, status = entry.status.as_str(), "dead letter not retryable");
            }
            Ok(entry)
        })
        .await
    }

    async fn record_dead_letter_error(&self, id: i64, error: &str) -> Result<()> {
        let error = error.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE dead_letters SET error_message = ?2 WHERE id = ?1",
                params![id, error],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("dead letter {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolved_by: &str,
        at: Timestamp,
    ) -> Result<DeadLetterEntry> {
        let resolved_by = resolved_by.to_string();

        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE dead_letters SET status = 'resolved', resolved_at = ?2, resolved_by = ?3
                 WHERE id = ?1",
                params![id, at, resolved_by],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("dead letter {}", id)));
            }
            fetch_dead_letter(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", id)))
        })
        .await
    }

    async fn delete_dead_letter(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let deleted = conn.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ship Registry
    // ─────────────────────────────────────────────────────────────────────────

    async fn record_heartbeat(
        &self,
        ship_id: &ShipId,
        ship_name: Option<&str>,
        at: Timestamp,
    ) -> Result<ShipRecord> {
        let ship_id = ship_id.clone();
        let ship_name = ship_name.map(str::to_string);

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ship_registry (ship_id, ship_name, connectivity_status, last_seen_at)
                 VALUES (?1, COALESCE(?2, ?1), 'online', ?3)
                 ON CONFLICT (ship_id) DO UPDATE SET
                    ship_name = COALESCE(?2, ship_registry.ship_name),
                    connectivity_status = 'online',
                    last_seen_at = MAX(ship_registry.last_seen_at, excluded.last_seen_at)",
                params![ship_id.as_str(), ship_name, at],
            )?;
            fetch_ship(conn, ship_id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("ship {}", ship_id)))
        })
        .await
    }

    async fn mark_stale_offline(&self, seen_before: Timestamp) -> Result<Vec<ShipId>> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let stale = {
                let mut stmt = tx.prepare(
                    "SELECT ship_id FROM ship_registry
                     WHERE connectivity_status = 'online' AND last_seen_at < ?1
                     ORDER BY ship_id",
                )?;
                let ids = stmt
                    .query_map(params![seen_before], |row| {
                        Ok(ShipId::new(row.get::<_, String>(0)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute(
                "UPDATE ship_registry SET connectivity_status = 'offline'
                 WHERE connectivity_status = 'online' AND last_seen_at < ?1",
                params![seen_before],
            )?;
            tx.commit()?;
            Ok(stale)
        })
        .await
    }

    async fn get_ship(&self, ship_id: &ShipId) -> Result<Option<ShipRecord>> {
        let ship_id = ship_id.clone();
        self.call(move |conn| fetch_ship(conn, ship_id.as_str())).await
    }

    async fn list_ships(&self) -> Result<Vec<ShipRecord>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ship_id, ship_name, connectivity_status, last_seen_at
                 FROM ship_registry ORDER BY ship_id",
            )?;
            let ships = stmt
                .query_map([], row_to_ship)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ships)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipsync_core::{ConflictType, ResolutionStrategy};

    fn new_entry(ship: &str, id: &str, op: Operation) -> NewQueueEntry {
        NewQueueEntry {
            ship_id: ShipId::new(ship),
            content_type: ContentType::new("api::article.article"),
            content_id: DocumentId::new(id),
            operation: op,
            local_version: 1,
            payload: Some(json!({"title": id})),
        }
    }

    fn new_conflict(ship_data: Value) -> NewConflict {
        NewConflict {
            content_type: ContentType::new("api::article.article"),
            content_id: DocumentId::new("m-1"),
            ship_id: ShipId::new("ship-1"),
            ship_data,
            master_data: json!({"title": "master"}),
            conflict_type: ConflictType::ConcurrentEdit,
        }
    }

    #[tokio::test]
    async fn test_dequeue_claims_fifo_once() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");

        for id in ["a", "b", "c"] {
            store.enqueue(new_entry("ship-1", id, Operation::Create)).await.unwrap();
        }
        store.enqueue(new_entry("ship-2", "x", Operation::Create)).await.unwrap();

        let first = store.dequeue(&ship, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.content_id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(first.iter().all(|e| e.status == QueueStatus::Syncing));

        // Claimed entries are invisible to a second dequeue.
        let second = store.dequeue(&ship, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content_id.as_str(), "c");
        assert_eq!(store.pending_count(&ship).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_supersede_pending_only_touches_one_document() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");
        let claimed = store.enqueue(new_entry("ship-1", "a", Operation::Update)).await.unwrap();
        store.dequeue(&ship, 1).await.unwrap();
        let stale = store.enqueue(new_entry("ship-1", "a", Operation::Update)).await.unwrap();
        let other = store.enqueue(new_entry("ship-1", "b", Operation::Update)).await.unwrap();

        let retired = store
            .supersede_pending(
                &ship,
                &ContentType::new("api::article.article"),
                &DocumentId::new("a"),
                "replaced by master",
            )
            .await
            .unwrap();
        assert_eq!(retired, 1);

        let stale = store.get_queue_entry(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, QueueStatus::ConflictRejected);
        assert_eq!(stale.error_message.as_deref(), Some("replaced by master"));
        let claimed = store.get_queue_entry(claimed.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Syncing);
        let other = store.get_queue_entry(other.id).await.unwrap().unwrap();
        assert_eq!(other.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_failed_retries_then_fails() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");
        let entry = store.enqueue(new_entry("ship-1", "a", Operation::Update)).await.unwrap();

        for _ in 0..2 {
            store.dequeue(&ship, 1).await.unwrap();
            let status = store.mark_failed(entry.id, "broker down", 3).await.unwrap();
            assert_eq!(status, QueueStatus::Pending);
        }
        store.dequeue(&ship, 1).await.unwrap();
        let status = store.mark_failed(entry.id, "broker down", 3).await.unwrap();
        assert_eq!(status, QueueStatus::Failed);

        let stored = store.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.error_message.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn test_outbox_survives_restart_and_requeues_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let ship = ShipId::new("ship-1");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.enqueue(new_entry("ship-1", "a", Operation::Create)).await.unwrap();
            store.enqueue(new_entry("ship-1", "b", Operation::Create)).await.unwrap();
            // Simulate a crash mid-push.
            store.dequeue(&ship, 1).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.pending_count(&ship).await.unwrap(), 1);
        assert_eq!(store.requeue_in_flight(&ship).await.unwrap(), 1);
        assert_eq!(store.pending_count(&ship).await.unwrap(), 2);

        let claimed = store.dequeue(&ship, 10).await.unwrap();
        assert_eq!(claimed[0].content_id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_conflict_outcome_applies_to_parked_entries() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");
        let entry = store.enqueue(new_entry("ship-1", "a", Operation::Update)).await.unwrap();
        store.dequeue(&ship, 1).await.unwrap();
        store.mark_synced(entry.id).await.unwrap();

        store.mark_conflict_pending(entry.id, 42, "master newer").await.unwrap();
        let parked = store.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(parked.status, QueueStatus::ConflictPending);
        assert_eq!(parked.conflict_id, Some(42));

        let changed = store
            .mark_conflict_outcome(42, QueueStatus::ConflictAccepted)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let done = store.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(done.status, QueueStatus::ConflictAccepted);
    }

    #[tokio::test]
    async fn test_set_mapping_upserts_and_never_regresses() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");
        let ct = ContentType::new("api::article.article");
        let replica = DocumentId::new("r-1");
        let master = DocumentId::new("m-1");

        let created = store
            .set_mapping(&ship, &ct, &replica, &master, SyncedBy::Ship, 100)
            .await
            .unwrap();
        assert_eq!(created.created_at, 100);
        assert_eq!(created.updated_at, 100);

        let touched = store
            .set_mapping(&ship, &ct, &replica, &master, SyncedBy::Master, 200)
            .await
            .unwrap();
        assert_eq!(touched.created_at, 100);
        assert_eq!(touched.updated_at, 200);
        assert_eq!(touched.last_synced_by, SyncedBy::Master);

        let stale = store
            .set_mapping(&ship, &ct, &replica, &master, SyncedBy::Ship, 150)
            .await
            .unwrap();
        assert_eq!(stale.updated_at, 200);

        let by_master = store.find_by_master_id(&ship, &ct, &master).await.unwrap().unwrap();
        assert_eq!(by_master.replica_document_id, replica);

        assert!(store.delete_mapping(&ship, &ct, &replica).await.unwrap());
        assert!(store.get_mapping(&ship, &ct, &replica).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_mapping_repoints_master_id() {
        let store = SqliteStore::open_memory().unwrap();
        let ship = ShipId::new("ship-1");
        let ct = ContentType::new("api::article.article");
        let master = DocumentId::new("m-1");

        store
            .set_mapping(&ship, &ct, &DocumentId::new("r-old"), &master, SyncedBy::Ship, 1)
            .await
            .unwrap();
        store
            .set_mapping(&ship, &ct, &DocumentId::new("r-new"), &master, SyncedBy::Ship, 2)
            .await
            .unwrap();

        let found = store.find_by_master_id(&ship, &ct, &master).await.unwrap().unwrap();
        assert_eq!(found.replica_document_id.as_str(), "r-new");
        assert!(store
            .get_mapping(&ship, &ct, &DocumentId::new("r-old"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_processed_is_write_once() {
        let store = SqliteStore::open_memory().unwrap();
        let id = MessageId::new("msg-1");

        assert!(store.record_processed(&id, ProcessedStatus::Processed, 10).await.unwrap());
        assert!(!store.record_processed(&id, ProcessedStatus::Failed, 20).await.unwrap());

        let record = store.get_processed(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessedStatus::Processed);
        assert_eq!(record.processed_at, 10);

        assert_eq!(store.prune_processed(11).await.unwrap(), 1);
        assert!(store.get_processed(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_conflict_is_refreshed_not_duplicated() {
        let store = SqliteStore::open_memory().unwrap();

        let first = store.upsert_conflict(new_conflict(json!({"v": 1})), 10).await.unwrap();
        let second = store.upsert_conflict(new_conflict(json!({"v": 2})), 20).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.ship_data, json!({"v": 2}));
        assert_eq!(store.list_conflicts(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_exactly_once() {
        let store = SqliteStore::open_memory().unwrap();
        let log = store.upsert_conflict(new_conflict(json!({"v": 1})), 10).await.unwrap();
        let resolution = ConflictResolution {
            strategy: ResolutionStrategy::KeepShip,
            data: None,
            resolved_by: "admin".into(),
        };

        let resolved = store.resolve_conflict(log.id, &resolution, 30).await.unwrap();
        assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::KeepShip));
        assert_eq!(resolved.resolved_at, Some(30));

        let again = ConflictResolution {
            strategy: ResolutionStrategy::KeepMaster,
            data: None,
            resolved_by: "other".into(),
        };
        let err = store.resolve_conflict(log.id, &again, 40).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyResolved(id) if id == log.id));

        let unchanged = store.get_conflict(log.id).await.unwrap().unwrap();
        assert_eq!(unchanged.resolution_strategy, Some(ResolutionStrategy::KeepShip));
        assert_eq!(unchanged.resolved_by.as_deref(), Some("admin"));

        // A new conflict for the same document opens a fresh row.
        let reopened = store.upsert_conflict(new_conflict(json!({"v": 3})), 50).await.unwrap();
        assert_ne!(reopened.id, log.id);

        assert!(matches!(
            store.resolve_conflict(9999, &resolution, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_exhausts_after_max_retries() {
        let store = SqliteStore::open_memory().unwrap();
        let entry = store
            .add_dead_letter(
                NewDeadLetter {
                    message_id: MessageId::new("msg-1"),
                    ship_id: Some(ShipId::new("ship-1")),
                    content_type: None,
                    content_id: None,
                    operation: Some(Operation::Update),
                    payload: json!({"raw": true}),
                    error_message: "validation failed".into(),
                    max_retries: 3,
                },
                1,
            )
            .await
            .unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Pending);

        let r1 = store.mark_dead_letter_retrying(entry.id, 2).await.unwrap();
        assert_eq!((r1.retry_count, r1.status), (1, DeadLetterStatus::Retrying));
        let r2 = store.mark_dead_letter_retrying(entry.id, 3).await.unwrap();
        assert_eq!((r2.retry_count, r2.status), (2, DeadLetterStatus::Retrying));
        let r3 = store.mark_dead_letter_retrying(entry.id, 4).await.unwrap();
        assert_eq!((r3.retry_count, r3.status), (3, DeadLetterStatus::Exhausted));

        // Exhausted entries are no longer counted or listed for retry.
        let r4 = store.mark_dead_letter_retrying(entry.id, 5).await.unwrap();
        assert_eq!(r4.retry_count, 3);
        assert!(store.pending_dead_letters(10).await.unwrap().is_empty());

        let resolved = store.resolve_dead_letter(entry.id, "ops", 6).await.unwrap();
        assert_eq!(resolved.status, DeadLetterStatus::Resolved);
        assert!(store.delete_dead_letter(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_and_stale_sweep() {
        let store = SqliteStore::open_memory().unwrap();
        let a = ShipId::new("ship-a");
        let b = ShipId::new("ship-b");

        let rec = store.record_heartbeat(&a, Some("Aurora"), 100).await.unwrap();
        assert_eq!(rec.ship_name, "Aurora");
        store.record_heartbeat(&b, None, 500).await.unwrap();

        let stale = store.mark_stale_offline(300).await.unwrap();
        assert_eq!(stale, vec![a.clone()]);
        let ship_a = store.get_ship(&a).await.unwrap().unwrap();
        assert_eq!(ship_a.connectivity_status, ConnectivityStatus::Offline);

        // Next heartbeat brings it back and keeps the known name.
        let back = store.record_heartbeat(&a, None, 600).await.unwrap();
        assert_eq!(back.connectivity_status, ConnectivityStatus::Online);
        assert_eq!(back.ship_name, "Aurora");
        assert_eq!(store.list_ships().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_outbound_queue_fifo_and_failure() {
        let store = SqliteStore::open_memory().unwrap();
        let first = store
            .outbound_enqueue("master-updates", "master", &json!({"n": 1}))
            .await
            .unwrap();
        store
            .outbound_enqueue("master-updates", "master", &json!({"n": 2}))
            .await
            .unwrap();

        let pending = store.outbound_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message, json!({"n": 1}));

        store.outbound_mark_sent(first.id).await.unwrap();
        assert_eq!(store.outbound_count().await.unwrap(), 1);

        let second = &pending[1];
        assert_eq!(
            store.outbound_mark_failed(second.id, "down", 1).await.unwrap(),
            OutboundStatus::Failed
        );
        assert_eq!(store.outbound_count().await.unwrap(), 0);
    }
}
