//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;

use shipsync_core::{
    now_millis, ConflictLog, ConflictResolution, ConnectivityStatus, ContentType,
    DeadLetterEntry, DeadLetterStatus, DocumentId, DocumentMapping, MessageId, NewConflict,
    NewDeadLetter, NewQueueEntry, OutboundEntry, OutboundStatus, ProcessedMessage,
    ProcessedStatus, QueueStatus, ShipId, ShipRecord, SyncQueueEntry, SyncedBy, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::traits::Store;

type MappingKey = (ShipId, ContentType, DocumentId);

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Outbox entries, keyed by id (ids are assigned in insertion order).
    queue: BTreeMap<i64, SyncQueueEntry>,
    next_queue_id: i64,

    outbound: BTreeMap<i64, OutboundEntry>,
    next_outbound_id: i64,

    /// (ship, content type, replica id) -> mapping.
    mappings: HashMap<MappingKey, DocumentMapping>,

    processed: HashMap<MessageId, ProcessedMessage>,

    conflicts: BTreeMap<i64, ConflictLog>,
    next_conflict_id: i64,

    dead_letters: BTreeMap<i64, DeadLetterEntry>,
    next_dead_letter_id: i64,

    ships: BTreeMap<ShipId, ShipRecord>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_entry_mut(inner: &mut MemoryStoreInner, id: i64) -> Result<&mut SyncQueueEntry> {
    inner
        .queue
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("sync queue entry {}", id)))
}

fn dead_letter_mut(inner: &mut MemoryStoreInner, id: i64) -> Result<&mut DeadLetterEntry> {
    inner
        .dead_letters
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", id)))
}

#[async_trait]
impl Store for MemoryStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Sync Queue
    // ─────────────────────────────────────────────────────────────────────────

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<SyncQueueEntry> {
        let mut inner = self.write()?;
        inner.next_queue_id += 1;
        let id = inner.next_queue_id;

        let stored = SyncQueueEntry {
            id,
            ship_id: entry.ship_id,
            content_type: entry.content_type,
            content_id: entry.content_id,
            operation: entry.operation,
            local_version: entry.local_version,
            payload: entry.payload,
            status: QueueStatus::Pending,
            error_message: None,
            retry_count: 0,
            conflict_id: None,
            created_at: now_millis(),
            synced_at: None,
        };
        inner.queue.insert(id, stored.clone());
        Ok(stored)
    }

    async fn dequeue(&self, ship_id: &ShipId, limit: usize) -> Result<Vec<SyncQueueEntry>> {
        let mut inner = self.write()?;

        let mut pending: Vec<&mut SyncQueueEntry> = inner
            .queue
            .values_mut()
            .filter(|e| &e.ship_id == ship_id && e.status == QueueStatus::Pending)
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.id));

        Ok(pending
            .into_iter()
            .take(limit)
            .map(|e| {
                e.status = QueueStatus::Syncing;
                e.clone()
            })
            .collect())
    }

    async fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        Ok(self.read()?.queue.get(&id).cloned())
    }

    async fn list_queue(
        &self,
        ship_id: &ShipId,
        status: Option<QueueStatus>,
    ) -> Result<Vec<SyncQueueEntry>> {
        let inner = self.read()?;
        let mut entries: Vec<_> = inner
            .queue
            .values()
            .filter(|e| &e.ship_id == ship_id && status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }

    async fn mark_synced(&self, id: i64) -> Result<()> {
        let mut inner = self.write()?;
        let entry = queue_entry_mut(&mut inner, id)?;
        entry.status = QueueStatus::Synced;
        entry.synced_at = Some(now_millis());
        entry.error_message = None;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, max_retries: u32) -> Result<QueueStatus> {
        let mut inner = self.write()?;
        let entry = queue_entry_mut(&mut inner, id)?;
        entry.retry_count += 1;
        entry.error_message = Some(error.to_string());
        entry.status = if entry.retry_count >= max_retries {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        Ok(entry.status)
    }

    async fn release(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.write()?;
        for id in ids {
            if let Some(entry) = inner.queue.get_mut(id) {
                if entry.status == QueueStatus::Syncing {
                    entry.status = QueueStatus::Pending;
                }
            }
        }
        Ok(())
    }

    async fn mark_conflict_pending(&self, id: i64, conflict_id: i64, reason: &str) -> Result<()> {
        let mut inner = self.write()?;
        let entry = queue_entry_mut(&mut inner, id)?;
        entry.status = QueueStatus::ConflictPending;
        entry.conflict_id = Some(conflict_id);
        entry.error_message = Some(reason.to_string());
        Ok(())
    }

    async fn mark_conflict_outcome(
        &self,
        conflict_id: i64,
        status: QueueStatus,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let now = now_millis();
        let mut changed = 0;
        for entry in inner.queue.values_mut() {
            if entry.conflict_id == Some(conflict_id)
                && entry.status == QueueStatus::ConflictPending
            {
                entry.status = status;
                entry.synced_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn supersede_pending(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        content_id: &DocumentId,
        reason: &str,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let now = now_millis();
        let mut changed = 0;
        for entry in inner.queue.values_mut() {
            if &entry.ship_id == ship_id
                && &entry.content_type == content_type
                && &entry.content_id == content_id
                && entry.status == QueueStatus::Pending
            {
                entry.status = QueueStatus::ConflictRejected;
                entry.error_message = Some(reason.to_string());
                entry.synced_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn requeue_in_flight(&self, ship_id: &ShipId) -> Result<usize> {
        let mut inner = self.write()?;
        let mut changed = 0;
        for entry in inner.queue.values_mut() {
            if &entry.ship_id == ship_id && entry.status == QueueStatus::Syncing {
                entry.status = QueueStatus::Pending;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn pending_count(&self, ship_id: &ShipId) -> Result<usize> {
        Ok(self
            .read()?
            .queue
            .values()
            .filter(|e| &e.ship_id == ship_id && e.status == QueueStatus::Pending)
            .count())
    }

    async fn cleanup_synced(&self, before: Timestamp) -> Result<usize> {
        let mut inner = self.write()?;
        let len = inner.queue.len();
        inner
            .queue
            .retain(|_, e| !(e.status == QueueStatus::Synced && e.created_at < before));
        Ok(len - inner.queue.len())
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
        let mut inner = self.write()?;
        inner.next_outbound_id += 1;
        let id = inner.next_outbound_id;

        let entry = OutboundEntry {
            id,
            topic: topic.to_string(),
            key: key.to_string(),
            message: message.clone(),
            status: OutboundStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: now_millis(),
            sent_at: None,
        };
        inner.outbound.insert(id, entry.clone());
        Ok(entry)
    }

    async fn outbound_pending(&self, limit: usize) -> Result<Vec<OutboundEntry>> {
        Ok(self
            .read()?
            .outbound
            .values()
            .filter(|e| e.status == OutboundStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn outbound_mark_sent(&self, id: i64) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner
            .outbound
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbound entry {}", id)))?;
        entry.status = OutboundStatus::Sent;
        entry.sent_at = Some(now_millis());
        Ok(())
    }

    async fn outbound_mark_failed(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboundStatus> {
        let mut inner = self.write()?;
        let entry = inner
            .outbound
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbound entry {}", id)))?;
        entry.retry_count += 1;
        entry.error_message = Some(error.to_string());
        entry.status = if entry.retry_count >= max_retries {
            OutboundStatus::Failed
        } else {
            OutboundStatus::Pending
        };
        Ok(entry.status)
    }

    async fn outbound_count(&self) -> Result<usize> {
        Ok(self
            .read()?
            .outbound
            .values()
            .filter(|e| e.status == OutboundStatus::Pending)
            .count())
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
        let mut inner = self.write()?;

        inner.mappings.retain(|_, m| {
            !(&m.ship_id == ship_id
                && &m.content_type == content_type
                && &m.master_document_id == master_document_id
                && &m.replica_document_id != replica_document_id)
        });

        let key = (
            ship_id.clone(),
            content_type.clone(),
            replica_document_id.clone(),
        );
        let mapping = inner
            .mappings
            .entry(key)
            .and_modify(|m| {
                m.master_document_id = master_document_id.clone();
                m.last_synced_by = synced_by;
                m.updated_at = m.updated_at.max(at);
            })
            .or_insert_with(|| DocumentMapping {
                ship_id: ship_id.clone(),
                content_type: content_type.clone(),
                replica_document_id: replica_document_id.clone(),
                master_document_id: master_document_id.clone(),
                last_synced_by: synced_by,
                created_at: at,
                updated_at: at,
            });
        Ok(mapping.clone())
    }

    async fn get_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>> {
        let key = (
            ship_id.clone(),
            content_type.clone(),
            replica_document_id.clone(),
        );
        Ok(self.read()?.mappings.get(&key).cloned())
    }

    async fn find_by_master_id(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<Option<DocumentMapping>> {
        Ok(self
            .read()?
            .mappings
            .values()
            .find(|m| {
                &m.ship_id == ship_id
                    && &m.content_type == content_type
                    && &m.master_document_id == master_document_id
            })
            .cloned())
    }

    async fn delete_mapping(
        &self,
        ship_id: &ShipId,
        content_type: &ContentType,
        replica_document_id: &DocumentId,
    ) -> Result<bool> {
        let key = (
            ship_id.clone(),
            content_type.clone(),
            replica_document_id.clone(),
        );
        Ok(self.write()?.mappings.remove(&key).is_some())
    }

    async fn delete_mappings_for_master(
        &self,
        content_type: &ContentType,
        master_document_id: &DocumentId,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let len = inner.mappings.len();
        inner.mappings.retain(|_, m| {
            !(&m.content_type == content_type && &m.master_document_id == master_document_id)
        });
        Ok(len - inner.mappings.len())
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
        let mut inner = self.write()?;
        if inner.processed.contains_key(message_id) {
            return Ok(false);
        }
        inner.processed.insert(
            message_id.clone(),
            ProcessedMessage {
                message_id: message_id.clone(),
                status,
                processed_at: at,
            },
        );
        Ok(true)
    }

    async fn get_processed(&self, message_id: &MessageId) -> Result<Option<ProcessedMessage>> {
        Ok(self.read()?.processed.get(message_id).cloned())
    }

    async fn update_processed(
        &self,
        message_id: &MessageId,
        status: ProcessedStatus,
    ) -> Result<()> {
        if let Some(record) = self.write()?.processed.get_mut(message_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn prune_processed(&self, before: Timestamp) -> Result<usize> {
        let mut inner = self.write()?;
        let len = inner.processed.len();
        inner.processed.retain(|_, p| p.processed_at >= before);
        Ok(len - inner.processed.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────────

    async fn upsert_conflict(&self, conflict: NewConflict, at: Timestamp) -> Result<ConflictLog> {
        let mut inner = self.write()?;

        let open = inner.conflicts.values_mut().find(|c| {
            c.resolved_at.is_none()
                && c.content_type == conflict.content_type
                && c.content_id == conflict.content_id
                && c.ship_id == conflict.ship_id
        });
        if let Some(existing) = open {
            existing.ship_data = conflict.ship_data;
            existing.master_data = conflict.master_data;
            existing.conflict_type = conflict.conflict_type;
            return Ok(existing.clone());
        }

        inner.next_conflict_id += 1;
        let id = inner.next_conflict_id;
        let log = ConflictLog {
            id,
            content_type: conflict.content_type,
            content_id: conflict.content_id,
            ship_id: conflict.ship_id,
            ship_data: conflict.ship_data,
            master_data: conflict.master_data,
            conflict_type: conflict.conflict_type,
            resolution_strategy: None,
            resolution_data: None,
            resolved_at: None,
            resolved_by: None,
            created_at: at,
        };
        inner.conflicts.insert(id, log.clone());
        Ok(log)
    }

    async fn get_conflict(&self, id: i64) -> Result<Option<ConflictLog>> {
        Ok(self.read()?.conflicts.get(&id).cloned())
    }

    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictLog>> {
        let inner = self.read()?;
        let mut logs: Vec<_> = inner
            .conflicts
            .values()
            .filter(|c| !unresolved_only || !c.is_resolved())
            .cloned()
            .collect();
        logs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(logs)
    }

    async fn resolve_conflict(
        &self,
        id: i64,
        resolution: &ConflictResolution,
        at: Timestamp,
    ) -> Result<ConflictLog> {
        let mut inner = self.write()?;
        let log = inner
            .conflicts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("conflict {}", id)))?;
        if log.is_resolved() {
            return Err(StoreError::AlreadyResolved(id));
        }
        log.resolution_strategy = Some(resolution.strategy);
        log.resolution_data = resolution.data.clone();
        log.resolved_at = Some(at);
        log.resolved_by = Some(resolution.resolved_by.clone());
        Ok(log.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dead Letters
    // ─────────────────────────────────────────────────────────────────────────

    async fn add_dead_letter(
        &self,
        entry: NewDeadLetter,
        at: Timestamp,
    ) -> Result<DeadLetterEntry> {
        let mut inner = self.write()?;

        if let Some(existing) = inner
            .dead_letters
            .values_mut()
            .find(|d| d.message_id == entry.message_id)
        {
            existing.error_message = entry.error_message;
            return Ok(existing.clone());
        }

        inner.next_dead_letter_id += 1;
        let id = inner.next_dead_letter_id;
        let stored = DeadLetterEntry {
            id,
            message_id: entry.message_id,
            ship_id: entry.ship_id,
            content_type: entry.content_type,
            content_id: entry.content_id,
            operation: entry.operation,
            payload: entry.payload,
            error_message: entry.error_message,
            retry_count: 0,
            max_retries: entry.max_retries,
            status: DeadLetterStatus::Pending,
            created_at: at,
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        inner.dead_letters.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_dead_letter(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        Ok(self.read()?.dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        Ok(self
            .read()?
            .dead_letters
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self
            .read()?
            .dead_letters
            .values()
            .filter(|d| d.status.is_retryable())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dead_letter_retrying(&self, id: i64, at: Timestamp) -> Result<DeadLetterEntry> {
        let mut inner = self.write()?;
        let entry = dead_letter_mut(&mut inner, id)?;
        if entry.status.is_retryable() {
            entry.retry_count += 1;
            entry.last_retry_at = Some(at);
            entry.status = if entry.retry_count >= entry.max_retries {
                DeadLetterStatus::Exhausted
            } else {
                DeadLetterStatus::Retrying
            };
        }
        Ok(entry.clone())
    }

    async fn record_dead_letter_error(&self, id: i64, error: &str) -> Result<()> {
        let mut inner = self.write()?;
        dead_letter_mut(&mut inner, id)?.error_message = error.to_string();
        Ok(())
    }

    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolved_by: &str,
        at: Timestamp,
    ) -> Result<DeadLetterEntry> {
        let mut inner = self.write()?;
        let entry = dead_letter_mut(&mut inner, id)?;
        entry.status = DeadLetterStatus::Resolved;
        entry.resolved_at = Some(at);
        entry.resolved_by = Some(resolved_by.to_string());
        Ok(entry.clone())
    }

    async fn delete_dead_letter(&self, id: i64) -> Result<bool> {
        Ok(self.write()?.dead_letters.remove(&id).is_some())
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
        let mut inner = self.write()?;
        let record = inner
            .ships
            .entry(ship_id.clone())
            .and_modify(|r| {
                if let Some(name) = ship_name {
                    r.ship_name = name.to_string();
                }
                r.connectivity_status = ConnectivityStatus::Online;
                r.last_seen_at = r.last_seen_at.max(at);
            })
            .or_insert_with(|| ShipRecord {
                ship_id: ship_id.clone(),
                ship_name: ship_name.unwrap_or(ship_id.as_str()).to_string(),
                connectivity_status: ConnectivityStatus::Online,
                last_seen_at: at,
            });
        Ok(record.clone())
    }

    async fn mark_stale_offline(&self, seen_before: Timestamp) -> Result<Vec<ShipId>> {
        let mut inner = self.write()?;
        let mut stale = Vec::new();
        for record in inner.ships.values_mut() {
            if record.connectivity_status == ConnectivityStatus::Online
                && record.last_seen_at < seen_before
            {
                record.connectivity_status = ConnectivityStatus::Offline;
                stale.push(record.ship_id.clone());
            }
        }
        Ok(stale)
    }

    async fn get_ship(&self, ship_id: &ShipId) -> Result<Option<ShipRecord>> {
        Ok(self.read()?.ships.get(ship_id).cloned())
    }

    async fn list_ships(&self) -> Result<Vec<ShipRecord>> {
        Ok(self.read()?.ships.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipsync_core::{ConflictType, Operation, ResolutionStrategy};

    fn new_entry(id: &str) -> NewQueueEntry {
        NewQueueEntry {
            ship_id: ShipId::new("ship-1"),
            content_type: ContentType::new("api::article.article"),
            content_id: DocumentId::new(id),
            operation: Operation::Create,
            local_version: 1,
            payload: Some(json!({"title": id})),
        }
    }

    #[tokio::test]
    async fn test_dequeue_and_requeue() {
        let store = MemoryStore::new();
        let ship = ShipId::new("ship-1");
        store.enqueue(new_entry("a")).await.unwrap();
        store.enqueue(new_entry("b")).await.unwrap();

        let claimed = store.dequeue(&ship, 1).await.unwrap();
        assert_eq!(claimed[0].content_id.as_str(), "a");
        assert_eq!(store.pending_count(&ship).await.unwrap(), 1);

        assert_eq!(store.requeue_in_flight(&ship).await.unwrap(), 1);
        assert_eq!(store.pending_count(&ship).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_supersede_pending() {
        let store = MemoryStore::new();
        let ship = ShipId::new("ship-1");
        let a = store.enqueue(new_entry("a")).await.unwrap();
        let b = store.enqueue(new_entry("b")).await.unwrap();

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
        assert_eq!(
            store.get_queue_entry(a.id).await.unwrap().unwrap().status,
            QueueStatus::ConflictRejected
        );
        assert_eq!(
            store.get_queue_entry(b.id).await.unwrap().unwrap().status,
            QueueStatus::Pending
        );
        assert_eq!(store.pending_count(&ship).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mapping_watermark_monotonic() {
        let store = MemoryStore::new();
        let ship = ShipId::new("ship-1");
        let ct = ContentType::new("api::page.page");
        let r = DocumentId::new("r");
        let m = DocumentId::new("m");

        store.set_mapping(&ship, &ct, &r, &m, SyncedBy::Ship, 50).await.unwrap();
        let mapping = store.set_mapping(&ship, &ct, &r, &m, SyncedBy::Master, 10).await.unwrap();
        assert_eq!(mapping.updated_at, 50);
        assert_eq!(mapping.last_synced_by, SyncedBy::Master);

        assert_eq!(store.delete_mappings_for_master(&ct, &m).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflict_resolved_once() {
        let store = MemoryStore::new();
        let log = store
            .upsert_conflict(
                NewConflict {
                    content_type: ContentType::new("api::page.page"),
                    content_id: DocumentId::new("m"),
                    ship_id: ShipId::new("ship-1"),
                    ship_data: json!({"a": 1}),
                    master_data: json!({"a": 2}),
                    conflict_type: ConflictType::ConcurrentEdit,
                },
                1,
            )
            .await
            .unwrap();

        let resolution = ConflictResolution {
            strategy: ResolutionStrategy::Merge,
            data: Some(json!({"a": 3})),
            resolved_by: "admin".into(),
        };
        store.resolve_conflict(log.id, &resolution, 2).await.unwrap();
        assert!(matches!(
            store.resolve_conflict(log.id, &resolution, 3).await,
            Err(StoreError::AlreadyResolved(_))
        ));
        assert!(store.list_conflicts(true).await.unwrap().is_empty());
        assert_eq!(store.list_conflicts(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processed_gate() {
        let store = MemoryStore::new();
        let id = MessageId::new("m-1");
        assert!(store.record_processed(&id, ProcessedStatus::Failed, 1).await.unwrap());
        assert!(!store.record_processed(&id, ProcessedStatus::Processed, 2).await.unwrap());
        store.update_processed(&id, ProcessedStatus::Processed).await.unwrap();
        assert_eq!(
            store.get_processed(&id).await.unwrap().unwrap().status,
            ProcessedStatus::Processed
        );
    }
}
