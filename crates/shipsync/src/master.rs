//! The master side of sync.
//!
//! Ship changes are applied with [`Origin::Ship`] after a conflict check
//! against the mapping watermark. Local master edits are broadcast to every
//! replica, or buffered in the outbound queue while the broker is down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shipsync_core::{
    now_millis, ConflictLog, ConflictNotice, ConflictResolution, ConflictType, ContentChange,
    ContentType, DeadLetterEntry, DeadLetterStatus, DocumentId, DocumentMapping, Envelope,
    Heartbeat, MappingAck, MessageBody, NewConflict, NodeRole, Operation, ResolutionNotice,
    ResolutionStrategy, ShipId, ShipRecord, SyncedBy,
};
use shipsync_store::{Store, StoreError};
use shipsync_sync::{
    spawn_registry_sweep, sweep_registry, ConflictDetector, ConnectivityMonitor,
    DeadLetterQueue, Dispatcher, MessageHandler, ReliableProducer, RetryReport, Topic,
    Transport,
};

use crate::config::EngineConfig;
use crate::content::{ContentStore, Document, Mutation, MutationHook, Origin};
use crate::error::{EngineError, Result};
use crate::hook::MutationFilter;
use crate::lifecycle::{self, spawn_maintenance, Lifecycle, SyncStatus};

const OUTBOUND_BATCH: usize = 100;

/// Whether a master message reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Stored in the outbound queue until the broker is reachable.
    Buffered,
}

/// Serializes check-then-apply sequences per master document.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<(ContentType, DocumentId), Arc<AsyncMutex<()>>>>,
}

impl DocumentLocks {
    async fn lock(&self, content_type: &ContentType, id: &DocumentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((content_type.clone(), id.clone()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }
}

/// Message handling and broadcasting for the master.
pub struct MasterNode<S: Store, C: ContentStore, T: Transport> {
    config: EngineConfig,
    store: Arc<S>,
    content: Arc<C>,
    producer: Arc<ReliableProducer<T>>,
    filter: MutationFilter,
    documents: DocumentLocks,
    flush: AsyncMutex<()>,
}

impl<S, C, T> MasterNode<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    // ─────────────────────────────────────────────────────────────────────────
    // Outbound: master edits
    // ─────────────────────────────────────────────────────────────────────────

    /// Broadcast a local master edit to every replica.
    pub async fn record_mutation(&self, mutation: &Mutation) -> Result<Option<SendOutcome>> {
        if !mutation.origin.is_local() {
            debug!(
                origin = mutation.origin.as_str(),
                content_type = %mutation.content_type,
                "mutation applied by sync, not broadcast"
            );
            return Ok(None);
        }
        let Some(change) = self.filter.classify(mutation) else {
            return Ok(None);
        };

        let envelope = Envelope::new(
            ShipId::master(),
            MessageBody::content(
                change.operation,
                ContentChange {
                    content_type: change.content_type.clone(),
                    content_id: change.document_id.clone(),
                    version: change.version,
                    data: change.payload,
                    metadata: None,
                },
            ),
        );
        let outcome = self.publish_or_buffer(Topic::MasterUpdates, &envelope).await?;

        if change.operation == Operation::Delete {
            self.store
                .delete_mappings_for_master(&change.content_type, &change.document_id)
                .await?;
        }

        info!(
            content_type = %change.content_type,
            content_id = %change.document_id,
            operation = change.operation.as_str(),
            ?outcome,
            "master change broadcast"
        );
        Ok(Some(outcome))
    }

    /// Send a message, or buffer it if the broker cannot be reached.
    ///
    /// While anything is buffered, new messages are buffered behind it so
    /// they reach replicas in order.
    pub async fn publish_or_buffer(&self, topic: Topic, envelope: &Envelope) -> Result<SendOutcome> {
        if self.store.outbound_count().await? > 0 && self.producer.is_connected() {
            self.flush_outbound().await?;
        }

        if self.store.outbound_count().await? == 0 {
            match self.producer.send(topic, envelope).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(e) if e.is_transport() => {
                    warn!(
                        message_id = %envelope.message_id,
                        operation = envelope.operation(),
                        error = %e,
                        "broker unreachable, buffering message"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let message = serde_json::to_value(envelope)?;
        let entry = self
            .store
            .outbound_enqueue(topic.as_str(), topic.partition_key(envelope), &message)
            .await?;
        debug!(outbound_id = entry.id, message_id = %envelope.message_id, "message buffered");
        Ok(SendOutcome::Buffered)
    }

    /// Deliver buffered messages, oldest first. Stops at the first transport
    /// failure; returns the number delivered.
    pub async fn flush_outbound(&self) -> Result<usize> {
        let _flushing = self.flush.lock().await;
        let mut flushed = 0;

        loop {
            let batch = self.store.outbound_pending(OUTBOUND_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                let decoded = serde_json::from_value::<Envelope>(entry.message.clone());
                let (topic, envelope) = match (Topic::parse(&entry.topic), decoded) {
                    (Some(topic), Ok(envelope)) => (topic, envelope),
                    (None, _) => {
                        let reason = format!("unknown topic {}", entry.topic);
                        self.store.outbound_mark_failed(entry.id, &reason, 0).await?;
                        error!(outbound_id = entry.id, %reason, "buffered message dropped");
                        continue;
                    }
                    (_, Err(e)) => {
                        self.store
                            .outbound_mark_failed(entry.id, &e.to_string(), 0)
                            .await?;
                        error!(outbound_id = entry.id, error = %e, "buffered message dropped");
                        continue;
                    }
                };

                match self.producer.send(topic, &envelope).await {
                    Ok(()) => {
                        self.store.outbound_mark_sent(entry.id).await?;
                        flushed += 1;
                    }
                    Err(e) if e.is_transport() => {
                        debug!(error = %e, flushed, "flush interrupted, broker unreachable");
                        return Ok(flushed);
                    }
                    Err(e) => {
                        let status = self
                            .store
                            .outbound_mark_failed(
                                entry.id,
                                &e.to_string(),
                                self.config.outbox_max_retries,
                            )
                            .await?;
                        warn!(outbound_id = entry.id, status = status.as_str(), error = %e, "flush failed");
                    }
                }
            }
        }

        if flushed > 0 {
            info!(flushed, "outbound buffer flushed");
        }
        Ok(flushed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound: ship changes
    // ─────────────────────────────────────────────────────────────────────────

    async fn apply_ship_change(
        &self,
        envelope: &Envelope,
        operation: Operation,
        change: &ContentChange,
    ) -> Result<()> {
        let ship_id = &envelope.ship_id;
        if ship_id.is_master() {
            debug!("own broadcast ignored");
            return Ok(());
        }
        if self.filter.is_excluded(&change.content_type) {
            debug!(content_type = %change.content_type, "content type not synced");
            return Ok(());
        }

        let mapping = self
            .store
            .get_mapping(ship_id, &change.content_type, &change.content_id)
            .await?;

        match (operation, mapping) {
            (Operation::Delete, Some(mapping)) => self.apply_ship_delete(ship_id, &mapping).await,
            (Operation::Delete, None) => {
                debug!(
                    %ship_id,
                    content_type = %change.content_type,
                    replica_id = %change.content_id,
                    "delete for unmapped document ignored"
                );
                Ok(())
            }
            (_, Some(mapping)) => self.apply_ship_update(ship_id, change, &mapping).await,
            (_, None) => self.apply_ship_create(ship_id, change).await,
        }
    }

    /// Create the master document, publish it and tell the ship its id.
    async fn apply_ship_create(&self, ship_id: &ShipId, change: &ContentChange) -> Result<()> {
        let content_type = &change.content_type;
        let data = change.data.clone().unwrap_or(Value::Null);

        let created = self.content.create(content_type, data, Origin::Ship).await?;
        let document = self
            .content
            .publish(content_type, &created.id, Origin::Ship)
            .await?;
        self.store
            .set_mapping(
                ship_id,
                content_type,
                &change.content_id,
                &document.id,
                SyncedBy::Ship,
                document.updated_at,
            )
            .await?;

        let ack = Envelope::new(
            ship_id.clone(),
            MessageBody::CreateAck(MappingAck {
                content_type: content_type.clone(),
                replica_document_id: change.content_id.clone(),
                master_document_id: document.id.clone(),
                synced_at: Some(document.updated_at),
            }),
        );
        self.publish_or_buffer(Topic::MasterUpdates, &ack).await?;

        info!(
            %ship_id,
            %content_type,
            replica_id = %change.content_id,
            master_id = %document.id,
            "ship document created"
        );
        Ok(())
    }

    /// Apply a ship update unless the master document moved since the last
    /// sync with this ship, in which case a conflict is recorded and the ship
    /// told.
    async fn apply_ship_update(
        &self,
        ship_id: &ShipId,
        change: &ContentChange,
        mapping: &DocumentMapping,
    ) -> Result<()> {
        let content_type = &change.content_type;
        let master_id = &mapping.master_document_id;
        let _guard = self.documents.lock(content_type, master_id).await;

        let Some(current) = self.content.find_one(content_type, master_id).await? else {
            warn!(%ship_id, %content_type, %master_id, "mapped master document is gone, recreating");
            self.store
                .delete_mapping(ship_id, content_type, &change.content_id)
                .await?;
            return self.apply_ship_create(ship_id, change).await;
        };

        let ship_data = change.data.clone().unwrap_or(Value::Null);
        let check = ConflictDetector::check_mapping(mapping, current.updated_at);
        if let Some(reason) = check.reason() {
            let conflict = self
                .store
                .upsert_conflict(
                    NewConflict {
                        content_type: content_type.clone(),
                        content_id: master_id.clone(),
                        ship_id: ship_id.clone(),
                        ship_data: ship_data.clone(),
                        master_data: current.data.clone(),
                        conflict_type: ConflictType::ConcurrentEdit,
                    },
                    now_millis(),
                )
                .await?;
            warn!(
                conflict_id = conflict.id,
                %ship_id,
                %content_type,
                %master_id,
                %reason,
                "ship update conflicts with master edit"
            );

            let notice = Envelope::new(
                ship_id.clone(),
                MessageBody::ConflictRejected(ConflictNotice {
                    conflict_id: conflict.id,
                    content_type: content_type.clone(),
                    content_id: master_id.clone(),
                    replica_document_id: change.content_id.clone(),
                    queue_entry_id: change.queue_entry_id(),
                    reason,
                    master_data: current.data,
                    ship_data,
                }),
            );
            self.publish_or_buffer(Topic::MasterUpdates, &notice).await?;
            return Ok(());
        }

        self.content
            .update(content_type, master_id, ship_data, Origin::Ship)
            .await?;
        let document = self
            .content
            .publish(content_type, master_id, Origin::Ship)
            .await?;
        self.store
            .set_mapping(
                ship_id,
                content_type,
                &change.content_id,
                master_id,
                SyncedBy::Ship,
                document.updated_at,
            )
            .await?;

        info!(%ship_id, %content_type, %master_id, "ship update applied");
        Ok(())
    }

    async fn apply_ship_delete(&self, ship_id: &ShipId, mapping: &DocumentMapping) -> Result<()> {
        let content_type = &mapping.content_type;
        let master_id = &mapping.master_document_id;
        let _guard = self.documents.lock(content_type, master_id).await;

        if self.content.find_one(content_type, master_id).await?.is_some() {
            self.content
                .delete(content_type, master_id, Origin::Ship)
                .await?;
        }
        self.store
            .delete_mapping(ship_id, content_type, &mapping.replica_document_id)
            .await?;
        info!(%ship_id, %content_type, %master_id, "ship delete applied");
        Ok(())
    }

    async fn record_heartbeat(&self, envelope: &Envelope, heartbeat: &Heartbeat) -> Result<()> {
        if envelope.ship_id.is_master() {
            return Ok(());
        }
        let record = self
            .store
            .record_heartbeat(&envelope.ship_id, heartbeat.ship_name.as_deref(), now_millis())
            .await?;
        debug!(ship_id = %record.ship_id, ship_name = %record.ship_name, "heartbeat");
        Ok(())
    }

    /// A ship holds the given master version of a document. The store keeps
    /// the watermark monotonic, so a late ack cannot move it back.
    async fn record_mapping_ack(&self, envelope: &Envelope, ack: &MappingAck) -> Result<()> {
        let synced_at = ack.synced_at.unwrap_or(envelope.timestamp);
        self.store
            .set_mapping(
                &envelope.ship_id,
                &ack.content_type,
                &ack.replica_document_id,
                &ack.master_document_id,
                SyncedBy::Master,
                synced_at,
            )
            .await?;
        debug!(
            ship_id = %envelope.ship_id,
            content_type = %ack.content_type,
            replica_id = %ack.replica_document_id,
            master_id = %ack.master_document_id,
            synced_at,
            "mapping acknowledged"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conflict resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve an open conflict and notify the ship.
    ///
    /// Runs under the document lock. The resolution is applied first and
    /// recorded last, so a failed apply leaves the conflict open for a retry
    /// and a recorded resolution is never applied twice.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        merge_data: Option<Value>,
        resolved_by: &str,
    ) -> Result<ConflictLog> {
        let log = self.open_conflict(id).await?;
        let merge_data = match (strategy, merge_data) {
            (ResolutionStrategy::Merge, None) => {
                return Err(EngineError::InvalidOperation(
                    "merge resolution requires merged data".into(),
                ));
            }
            (ResolutionStrategy::Merge, Some(data)) => Some(data),
            (_, _) => None,
        };

        let content_type = &log.content_type;
        let master_id = &log.content_id;
        let _guard = self.documents.lock(content_type, master_id).await;
        // Another resolver may have finished while this one waited.
        let log = self.open_conflict(id).await?;

        let document = match (strategy, &merge_data) {
            (ResolutionStrategy::KeepShip, _) => {
                self.overwrite(content_type, master_id, log.ship_data.clone())
                    .await?
            }
            (ResolutionStrategy::Merge, Some(data)) => {
                self.overwrite(content_type, master_id, data.clone()).await?
            }
            (_, _) => {
                self.content
                    .publish(content_type, master_id, Origin::Local)
                    .await?
            }
        };

        let mapping = self
            .store
            .find_by_master_id(&log.ship_id, content_type, master_id)
            .await?;
        if let Some(mapping) = &mapping {
            self.store
                .set_mapping(
                    &log.ship_id,
                    content_type,
                    &mapping.replica_document_id,
                    master_id,
                    SyncedBy::Master,
                    document.updated_at,
                )
                .await?;
        }

        let resolved = self
            .store
            .resolve_conflict(
                id,
                &ConflictResolution {
                    strategy,
                    data: merge_data,
                    resolved_by: resolved_by.to_string(),
                },
                now_millis(),
            )
            .await?;

        let notice = Envelope::new(
            log.ship_id.clone(),
            MessageBody::ConflictResolved(ResolutionNotice {
                conflict_id: id,
                content_type: content_type.clone(),
                content_id: master_id.clone(),
                replica_document_id: mapping.map(|m| m.replica_document_id),
                resolution: strategy,
                master_data: log.master_data.clone(),
                ship_data: log.ship_data.clone(),
                resolved_data: Some(document.data),
            }),
        );
        self.publish_or_buffer(Topic::MasterUpdates, &notice).await?;

        info!(
            conflict_id = id,
            ship_id = %log.ship_id,
            resolution = strategy.as_str(),
            resolved_by,
            "conflict resolved"
        );
        Ok(resolved)
    }

    async fn open_conflict(&self, id: i64) -> Result<ConflictLog> {
        let log = self
            .store
            .get_conflict(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conflict {id}")))?;
        if log.is_resolved() {
            return Err(StoreError::AlreadyResolved(id).into());
        }
        Ok(log)
    }

    /// Replace and republish a master document as a local edit, which
    /// broadcasts it to every replica.
    async fn overwrite(
        &self,
        content_type: &ContentType,
        id: &DocumentId,
        data: Value,
    ) -> Result<Document> {
        self.content
            .update(content_type, id, data, Origin::Local)
            .await?;
        Ok(self.content.publish(content_type, id, Origin::Local).await?)
    }
}

#[async_trait]
impl<S, C, T> MessageHandler for MasterNode<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    async fn on_content(
        &self,
        envelope: &Envelope,
        operation: Operation,
        change: &ContentChange,
    ) -> shipsync_sync::Result<()> {
        Ok(self.apply_ship_change(envelope, operation, change).await?)
    }

    async fn on_heartbeat(
        &self,
        envelope: &Envelope,
        heartbeat: &Heartbeat,
    ) -> shipsync_sync::Result<()> {
        Ok(self.record_heartbeat(envelope, heartbeat).await?)
    }

    async fn on_mapping_ack(&self, envelope: &Envelope, ack: &MappingAck) -> shipsync_sync::Result<()> {
        Ok(self.record_mapping_ack(envelope, ack).await?)
    }
}

/// The master's sync engine.
pub struct MasterEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    node: Arc<MasterNode<S, C, T>>,
    consumer: Arc<T>,
    dispatcher: Arc<Dispatcher<S, MasterNode<S, C, T>>>,
    monitor: Arc<ConnectivityMonitor<T>>,
    running: AsyncMutex<Option<Lifecycle>>,
}

impl<S, C, T> MasterEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    /// Create the master engine.
    ///
    /// `producer` sends on `master-updates`; `consumer` reads `ship-updates`.
    pub fn new(
        mut config: EngineConfig,
        store: Arc<S>,
        content: Arc<C>,
        producer: T,
        consumer: T,
    ) -> Result<Self> {
        if config.role != NodeRole::Master {
            return Err(EngineError::Config(format!(
                "master engine built with role {}",
                config.role
            )));
        }
        config.ship_id = ShipId::master();

        let producer = Arc::new(ReliableProducer::new(producer, config.transport.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&producer),
            config.monitor.clone(),
        ));
        let node = Arc::new(MasterNode {
            filter: MutationFilter::new(config.excluded_content_prefixes.clone()),
            config,
            store: Arc::clone(&store),
            content,
            producer,
            documents: DocumentLocks::default(),
            flush: AsyncMutex::new(()),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            Arc::clone(&node),
            node.config.dead_letter_max_retries,
        ));

        let flusher = Arc::downgrade(&node);
        monitor.on_reconnect(move || {
            let Some(node) = flusher.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = node.flush_outbound().await {
                    warn!(error = %e, "outbound flush after reconnect failed");
                }
            });
        });

        Ok(Self {
            node,
            consumer: Arc::new(consumer),
            dispatcher,
            monitor,
            running: AsyncMutex::new(None),
        })
    }

    pub fn node(&self) -> &Arc<MasterNode<S, C, T>> {
        &self.node
    }

    pub fn config(&self) -> &EngineConfig {
        &self.node.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.node.store
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor<T>> {
        &self.monitor
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn handle_mutation(&self, mutation: &Mutation) -> Result<Option<SendOutcome>> {
        self.node.record_mutation(mutation).await
    }

    pub async fn flush_outbound(&self) -> Result<usize> {
        self.node.flush_outbound().await
    }

    /// Dispatch every delivery currently waiting on `ship-updates`.
    pub async fn pump(&self, wait: Duration) -> Result<usize> {
        lifecycle::pump(
            self.dispatcher.as_ref(),
            self.consumer.as_ref(),
            &[Topic::ShipUpdates],
            wait,
        )
        .await
    }

    pub async fn resolve_conflict(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        merge_data: Option<Value>,
        resolved_by: &str,
    ) -> Result<ConflictLog> {
        self.node
            .resolve_conflict(id, strategy, merge_data, resolved_by)
            .await
    }

    /// Conflicts, newest first.
    pub async fn conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictLog>> {
        Ok(self.node.store.list_conflicts(unresolved_only).await?)
    }

    pub async fn conflict(&self, id: i64) -> Result<Option<ConflictLog>> {
        Ok(self.node.store.get_conflict(id).await?)
    }

    pub async fn ships(&self) -> Result<Vec<ShipRecord>> {
        Ok(self.node.store.list_ships().await?)
    }

    /// Flip silent ships to offline now.
    pub async fn sweep_ships(&self) -> Result<Vec<ShipId>> {
        Ok(sweep_registry(self.node.store.as_ref(), &self.node.config.heartbeat).await?)
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue<S> {
        self.dispatcher.dead_letters()
    }

    pub async fn retry_dead_letters(&self) -> Result<RetryReport> {
        Ok(self
            .dispatcher
            .retry_dead_letters(self.node.config.dead_letter_batch)
            .await?)
    }

    /// Dead letters, optionally filtered by status.
    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.dead_letters().list(status, limit).await?)
    }

    /// Close a dead letter by hand after the operator dealt with it.
    pub async fn resolve_dead_letter(&self, id: i64, resolved_by: &str) -> Result<DeadLetterEntry> {
        if self.dead_letters().get(id).await?.is_none() {
            return Err(EngineError::NotFound(format!("dead letter {id}")));
        }
        let entry = self.dead_letters().mark_resolved(id, resolved_by).await?;
        info!(dead_letter_id = id, resolved_by, "dead letter resolved");
        Ok(entry)
    }

    pub async fn delete_dead_letter(&self, id: i64) -> Result<bool> {
        Ok(self.dead_letters().delete(id).await?)
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            mode: NodeRole::Master,
            ship_id: ShipId::master(),
            connected: self.node.producer.is_connected(),
            pending_count: self.node.store.outbound_count().await?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::InvalidOperation("master already started".into()));
        }

        let config = &self.node.config;
        if let Err(e) = self.node.producer.connect().await {
            warn!(error = %e, "broker unreachable at startup, starting offline");
        }

        let mut lifecycle = Lifecycle::new();

        let dispatcher = Arc::clone(&self.dispatcher);
        let consumer = Arc::clone(&self.consumer);
        let poll_interval = config.consumer_poll_interval;
        let shutdown = lifecycle.consumer_signal();
        lifecycle.set_consumer(tokio::spawn(async move {
            dispatcher
                .run(consumer.as_ref(), &[Topic::ShipUpdates], poll_interval, shutdown)
                .await;
        }));

        lifecycle.add_timer(Arc::clone(&self.monitor).spawn(lifecycle.timer_signal()));
        lifecycle.add_timer(spawn_outbound_flush(
            Arc::clone(&self.node),
            config.monitor.probe_interval,
            lifecycle.timer_signal(),
        ));
        lifecycle.add_timer(spawn_registry_sweep(
            Arc::clone(&self.node.store),
            config.heartbeat.clone(),
            lifecycle.timer_signal(),
        ));
        lifecycle.add_timer(Arc::clone(&self.dispatcher).spawn_retry_sweep(
            config.dead_letter_retry_interval,
            config.dead_letter_batch,
            lifecycle.timer_signal(),
        ));
        lifecycle.add_timer(spawn_maintenance(
            self.dispatcher.tracker().clone(),
            Arc::clone(&self.node.store),
            config.maintenance_interval,
            config.processed_retention,
            lifecycle.timer_signal(),
        ));

        *running = Some(lifecycle);
        info!("master engine started");
        Ok(())
    }

    /// Stop timers, then the consumer, then disconnect the producer.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(lifecycle) = self.running.lock().await.take() else {
            return Ok(());
        };
        lifecycle.stop().await;
        self.node.producer.disconnect().await?;
        info!("master engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Retry the outbound buffer every `interval` while the broker is up.
fn spawn_outbound_flush<S, C, T>(
    node: Arc<MasterNode<S, C, T>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if !node.producer.is_connected() {
                continue;
            }
            match node.store.outbound_count().await {
                Ok(0) => {}
                Ok(_) => {
                    if let Err(e) = node.flush_outbound().await {
                        warn!(error = %e, "periodic outbound flush failed");
                    }
                }
                Err(e) => warn!(error = %e, "could not count buffered messages"),
            }
        }
    })
}

#[async_trait]
impl<S, C, T> MutationHook for MasterEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    async fn on_mutation(&self, mutation: &Mutation) {
        if let Err(e) = self.handle_mutation(mutation).await {
            error!(
                content_type = %mutation.content_type,
                action = ?mutation.action,
                error = %e,
                "failed to broadcast master change"
            );
        }
    }
}
