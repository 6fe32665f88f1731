//! Store trait: the abstract interface for sync-state persistence.
//!
//! This trait keeps the engine storage-agnostic. Implementations include
//! SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use serde_json::Value;

use shipsync_core::{
    ConflictLog, ConflictResolution, ContentType, DeadLetterEntry, DeadLetterStatus, DocumentId,
    DocumentMapping, MessageId, NewConflict, NewDeadLetter, NewQueueEntry, OutboundEntry,
    OutboundStatus, ProcessedMessage, ProcessedStatus, QueueStatus, ShipId, ShipRecord,
    SyncQueueEntry, SyncedBy, Timestamp,
};

use crate::error::Result;

/// The Store trait: async interface for every record the sync engine keeps.
///
/// # Design Notes
///
/// - **Claim-then-transmit**: [`Store::dequeue`] moves entries to `syncing`
///   in one step, so an entry is visible to exactly one push attempt.
/// - **Atomic upserts**: mappings, open conflicts and heartbeats are single
///   conditional writes, never check-then-insert sequences.
/// - **Write-once idempotency**: [`Store::record_processed`] reports whether
///   the message id was new.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Sync Queue (replica outbox)
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a new `pending` entry.
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<SyncQueueEntry>;

    /// Atomically claim up to `limit` pending entries, oldest first,
    /// flipping them to `syncing`.
    async fn dequeue(&self, ship_id: &ShipId, limit: usize) -> Result<Vec<SyncQueueEntry>>;

    /// Get an entry by id.
    async fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>>;

    /// List entries for a ship, optionally filtered by status, oldest first.
    async fn list_queue(
        &self,
        ship_id: &ShipId,
        status: Option<QueueStatus>,
    ) -> Result<Vec<SyncQueueEntry>>;

    /// Mark a claimed entry as delivered.
    async fn mark_synced(&self, id: i64) -> Result<()>;

    /// Record a failed delivery.
    ///
    /// Increments `retry_count`; the entry returns to `pending` while
    /// `retry_count < max_retries`, otherwise it becomes `failed`.
    /// Returns the resulting status.
    async fn mark_failed(&self, id: i64, error: &str, max_retries: u32) -> Result<QueueStatus>;

    /// Return claimed entries to `pending` without counting a retry.
    async fn release(&self, ids: &[i64]) -> Result<()>;

    /// Park an entry behind a master-side conflict.
    async fn mark_conflict_pending(&self, id: i64, conflict_id: i64, reason: &str) -> Result<()>;

    /// Record the outcome of a resolved conflict on every entry parked behind it.
    async fn mark_conflict_outcome(&self, conflict_id: i64, status: QueueStatus)
        -> Result<usize>;

    /// Retire the `pending` entries of one document after a master change
    /// replaced it locally. They become `conflict_rejected` with `reason`.
    async fn supersede_pending(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        content_id: &DocumentId,
        reason: &str,
    ) -> Result<usize>;

    /// Crash recovery: flip every `syncing` entry of a ship back to `pending`.
    async fn requeue_in_flight(&self, ship_id: &ShipId) -> Result<usize>;

    /// Number of `pending` entries for a ship.
    async fn pending_count(&self, ship_id: &ShipId) -> Result<usize>;

    /// Delete `synced` entries created before `before`.
    async fn cleanup_synced(&self, before: Timestamp) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Master Outbound Queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Buffer an encoded message for later delivery.
    async fn outbound_enqueue(&self, topic: &str, key: &str, message: &Value)
        -> Result<OutboundEntry>;

    /// Pending buffered messages, oldest first.
    async fn outbound_pending(&self, limit: usize) -> Result<Vec<OutboundEntry>>;

    async fn outbound_mark_sent(&self, id: i64) -> Result<()>;

    /// Record a failed flush; `failed` once `max_retries` is reached.
    async fn outbound_mark_failed(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboundStatus>;

    /// Number of pending buffered messages.
    async fn outbound_count(&self) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Document Mapping
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert a mapping, moving its watermark to `at` (never backwards).
    ///
    /// A master id previously mapped to a different replica id for the same
    /// ship and content type is re-pointed.
    async fn set_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
        master_document_id: &DocumentId,
        synced_by: SyncedBy,
        at: Timestamp,
    ) -> Result<DocumentMapping>;

    async fn get_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>>;

    async fn find_by_master_id(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>>;

    /// Returns true if a mapping was removed.
    async fn delete_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<bool>;

    /// Remove the mappings of every ship for a master document.
    async fn delete_mappings_for_master(
        &self,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Processed Messages (idempotency)
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a message id. Returns false if it was already recorded; the
    /// existing record is left untouched.
    async fn record_processed(
        &self,
        message_id: &MessageId,
        status: ProcessedStatus,
        at: Timestamp,
    ) -> Result<bool>;

    async fn get_processed(&self, message_id: &MessageId) -> Result<Option<ProcessedMessage>>;

    /// Overwrite the status of a recorded message (dead-letter replay success).
    async fn update_processed(&self, message_id: &MessageId, status: ProcessedStatus)
        -> Result<()>;

    /// Delete records processed before `before`.
    async fn prune_processed(&self, before: Timestamp) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a conflict, or refresh the open one for the same
    /// `(content_type, content_id, ship_id)`.
    async fn upsert_conflict(&self, conflict: NewConflict, at: Timestamp) -> Result<ConflictLog>;

    async fn get_conflict(&self, id: i64) -> Result<Option<ConflictLog>>;

    /// Newest first.
    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictLog>>;

    /// Apply a resolution exactly once.
    ///
    /// Fails with `NotFound` for an unknown id and `AlreadyResolved` if a
    /// resolution was already recorded; neither case changes state.
    async fn resolve_conflict(
        &self,
        id: i64,
        resolution: &ConflictResolution,
        at: Timestamp,
    ) -> Result<ConflictLog>;

    // ─────────────────────────────────────────────────────────────────────────
    // Dead Letters
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a failure. A second failure for the same message id refreshes
    /// the error instead of creating a new entry.
    async fn add_dead_letter(&self, entry: NewDeadLetter, at: Timestamp)
        -> Result<DeadLetterEntry>;

    async fn get_dead_letter(&self, id: i64) -> Result<Option<DeadLetterEntry>>;

    /// Oldest first.
    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>>;

    /// Entries in `pending` or `retrying`, oldest first.
    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Count a retry; the entry becomes `exhausted` once
    /// `retry_count >= max_retries`, otherwise `retrying`.
    async fn mark_dead_letter_retrying(&self, id: i64, at: Timestamp) -> Result<DeadLetterEntry>;

    async fn record_dead_letter_error(&self, id: i64, error: &str) -> Result<()>;

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolved_by: &str,
        at: Timestamp,
    ) -> Result<DeadLetterEntry>;

    /// Returns true if an entry was removed.
    async fn delete_dead_letter(&self, id: i64) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Ship Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert on heartbeat: create or refresh `last_seen_at` and go `online`.
    async fn record_heartbeat(
        &self,
        ship_id: &ShipId,
        ship_name: Option<&str>,
        at: Timestamp,
    ) -> Result<ShipRecord>;

    /// Flip `online` ships last seen before `seen_before` to `offline`.
    async fn mark_stale_offline(&self, seen_before: Timestamp) -> Result<Vec<ShipId>>;

    async fn get_ship(&self, ship_id: &ShipId) -> Result<Option<ShipRecord>>;

    async fn list_ships(&self) -> Result<Vec<ShipRecord>>;
}
