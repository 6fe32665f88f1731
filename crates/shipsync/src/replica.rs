//! The replica (ship) side of sync.
//!
//! Local edits are captured into the persistent outbox and pushed to the
//! master whenever the transport is up. Master changes are applied with
//! [`Origin::Master`] so they are never queued back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use shipsync_core::{
    now_millis, ChangeMetadata, ConflictNotice, ConflictType, ContentChange, ContentType,
    DocumentId, Envelope, MappingAck, MessageBody, NewConflict, NewQueueEntry, NodeRole,
    Operation, QueueStatus, ResolutionNotice, ResolutionStrategy, ShipId, SyncQueueEntry,
    SyncedBy,
};
use shipsync_store::Store;
use shipsync_sync::{
    spawn_heartbeat, ConflictDetector, ConnectivityMonitor, DeadLetterQueue, Dispatcher,
    MessageHandler, PushHandle, PushWorker, Pusher, ReliableProducer, RetryReport, SyncError,
    Topic, Transport,
};

use crate::config::{EngineConfig, LocalConflictPolicy};
use crate::content::{ContentStore, Mutation, MutationHook, Origin};
use crate::error::{EngineError, Result};
use crate::hook::MutationFilter;
use crate::lifecycle::{self, spawn_maintenance, Lifecycle, SyncStatus};

/// Message handling and outbox pushing for one ship.
pub struct ReplicaNode<S: Store, C: ContentStore, T: Transport> {
    config: EngineConfig,
    store: Arc<S>,
    content: Arc<C>,
    producer: Arc<ReliableProducer<T>>,
    filter: MutationFilter,
}

impl<S, C, T> ReplicaNode<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    pub fn ship_id(&self) -> &ShipId {
        &self.config.ship_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound: local edits
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a local mutation for the master.
    ///
    /// Returns `None` for mutations that are not synced: changes applied by
    /// the engine itself, internal content types, unpublish events.
    pub async fn record_mutation(&self, mutation: &Mutation) -> Result<Option<SyncQueueEntry>> {
        if !mutation.origin.is_local() {
            debug!(
                origin = mutation.origin.as_str(),
                content_type = %mutation.content_type,
                "mutation applied by sync, not queued"
            );
            return Ok(None);
        }
        let Some(change) = self.filter.classify(mutation) else {
            return Ok(None);
        };

        let entry = self
            .store
            .enqueue(NewQueueEntry {
                ship_id: self.config.ship_id.clone(),
                content_type: change.content_type,
                content_id: change.document_id,
                operation: change.operation,
                local_version: change.version,
                payload: change.payload,
            })
            .await?;

        info!(
            queue_entry_id = entry.id,
            content_type = %entry.content_type,
            content_id = %entry.content_id,
            operation = entry.operation.as_str(),
            "local change queued"
        );
        Ok(Some(entry))
    }

    /// Push pending outbox entries, oldest first, until none are left.
    ///
    /// Does nothing while the transport is down. A transport failure counts
    /// a retry against the entry being sent, returns the rest of the batch
    /// to `pending` and stops; other failures only affect their own entry.
    pub async fn push_pending(&self) -> Result<usize> {
        if !self.producer.is_connected() {
            debug!("transport offline, push deferred");
            return Ok(0);
        }

        let ship_id = &self.config.ship_id;
        let mut pushed = 0;

        loop {
            let batch = self
                .store
                .dequeue(ship_id, self.config.push.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut had_failure = false;
            for (index, entry) in batch.iter().enumerate() {
                match self.push_entry(entry).await {
                    Ok(()) => {
                        self.store.mark_synced(entry.id).await?;
                        self.after_push(entry).await?;
                        pushed += 1;
                    }
                    Err(e) => {
                        had_failure = true;
                        let status = self
                            .store
                            .mark_failed(entry.id, &e.to_string(), self.config.outbox_max_retries)
                            .await?;
                        warn!(
                            queue_entry_id = entry.id,
                            retry = entry.retry_count + 1,
                            status = status.as_str(),
                            error = %e,
                            "push failed"
                        );
                        if e.is_transport() {
                            let rest: Vec<i64> = batch[index + 1..].iter().map(|e| e.id).collect();
                            self.store.release(&rest).await?;
                            return Ok(pushed);
                        }
                    }
                }
            }
            if had_failure {
                break;
            }
        }

        if pushed > 0 {
            info!(pushed, "outbox pushed");
        }
        Ok(pushed)
    }

    async fn push_entry(&self, entry: &SyncQueueEntry) -> Result<()> {
        let change = ContentChange {
            content_type: entry.content_type.clone(),
            content_id: entry.content_id.clone(),
            version: entry.local_version,
            data: entry.payload.clone(),
            metadata: Some(ChangeMetadata {
                queue_entry_id: Some(entry.id),
            }),
        };
        let envelope = Envelope::new(
            self.config.ship_id.clone(),
            MessageBody::content(entry.operation, change),
        );
        self.producer.send(Topic::ShipUpdates, &envelope).await?;
        debug!(
            queue_entry_id = entry.id,
            message_id = %envelope.message_id,
            "entry sent"
        );
        Ok(())
    }

    /// Keep the local mapping in step with what the master now holds.
    async fn after_push(&self, entry: &SyncQueueEntry) -> Result<()> {
        let ship_id = &self.config.ship_id;
        match entry.operation {
            Operation::Update => {
                let mapping = self
                    .store
                    .get_mapping(ship_id, &entry.content_type, &entry.content_id)
                    .await?;
                if let Some(mapping) = mapping {
                    self.store
                        .set_mapping(
                            ship_id,
                            &entry.content_type,
                            &entry.content_id,
                            &mapping.master_document_id,
                            SyncedBy::Ship,
                            entry.local_version,
                        )
                        .await?;
                }
            }
            Operation::Delete => {
                self.store
                    .delete_mapping(ship_id, &entry.content_type, &entry.content_id)
                    .await?;
            }
            // Mapped when the create-ack arrives.
            Operation::Create => {}
        }
        Ok(())
    }

    pub async fn has_pending(&self) -> Result<bool> {
        Ok(self.store.pending_count(&self.config.ship_id).await? > 0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound: master changes
    // ─────────────────────────────────────────────────────────────────────────

    async fn apply_master_change(
        &self,
        envelope: &Envelope,
        operation: Operation,
        change: &ContentChange,
    ) -> Result<()> {
        if !envelope.ship_id.is_master() {
            debug!(from = %envelope.ship_id, "content change not sent by master ignored");
            return Ok(());
        }
        if self.filter.is_excluded(&change.content_type) {
            debug!(content_type = %change.content_type, "content type not synced");
            return Ok(());
        }

        let ship_id = &self.config.ship_id;
        let content_type = &change.content_type;
        let master_id = &change.content_id;
        let mapping = self
            .store
            .find_by_master_id(ship_id, content_type, master_id)
            .await?;

        if operation == Operation::Delete {
            let Some(mapping) = mapping else {
                debug!(%content_type, %master_id, "delete for unknown document ignored");
                return Ok(());
            };
            let replica_id = &mapping.replica_document_id;
            if self.content.find_one(content_type, replica_id).await?.is_some() {
                self.content
                    .delete(content_type, replica_id, Origin::Master)
                    .await?;
            }
            self.store
                .delete_mapping(ship_id, content_type, replica_id)
                .await?;
            info!(%content_type, %master_id, %replica_id, "master delete applied");
            return Ok(());
        }

        let data = change.data.clone().unwrap_or(Value::Null);
        let local = match &mapping {
            Some(mapping) => {
                self.content
                    .find_one(content_type, &mapping.replica_document_id)
                    .await?
            }
            None => None,
        };

        let mut in_flight = false;
        let document = match (mapping, local) {
            (Some(mapping), Some(local)) => {
                let check = ConflictDetector::check_mapping(&mapping, local.updated_at);
                if let Some(reason) = check.reason() {
                    match self.config.local_conflict_policy {
                        LocalConflictPolicy::MasterWins => {
                            // Queued edits would otherwise replay the old
                            // state over the master's once pushed.
                            let superseded = self
                                .store
                                .supersede_pending(
                                    ship_id,
                                    content_type,
                                    &local.id,
                                    "superseded by master change",
                                )
                                .await?;
                            in_flight = self.has_in_flight(content_type, &local.id).await?;
                            warn!(
                                %content_type,
                                replica_id = %local.id,
                                %reason,
                                superseded,
                                in_flight,
                                "unsynced local edit overwritten by master"
                            );
                        }
                        LocalConflictPolicy::RecordConflict => {
                            let conflict = self
                                .store
                                .upsert_conflict(
                                    NewConflict {
                                        content_type: content_type.clone(),
                                        content_id: master_id.clone(),
                                        ship_id: ship_id.clone(),
                                        ship_data: local.data,
                                        master_data: data,
                                        conflict_type: ConflictType::LocalEdit,
                                    },
                                    now_millis(),
                                )
                                .await?;
                            warn!(
                                conflict_id = conflict.id,
                                %content_type,
                                replica_id = %local.id,
                                %reason,
                                "master change held back by local edit"
                            );
                            return Ok(());
                        }
                    }
                }
                self.content
                    .update(content_type, &local.id, data, Origin::Master)
                    .await?
            }
            _ => {
                let created = self
                    .content
                    .create(content_type, data, Origin::Master)
                    .await?;
                info!(%content_type, %master_id, replica_id = %created.id, "master document created locally");
                created
            }
        };

        self.store
            .set_mapping(
                ship_id,
                content_type,
                &document.id,
                master_id,
                SyncedBy::Master,
                document.updated_at,
            )
            .await?;
        if in_flight {
            // An ack would advance the master's watermark past the edit
            // already on the wire, hiding the conflict it carries.
            debug!(%content_type, replica_id = %document.id, "mapping-ack withheld while an edit is in flight");
        } else {
            self.send_mapping_ack(content_type, &document.id, master_id, change.version)
                .await;
        }
        Ok(())
    }

    /// Whether a claimed queue entry for this document is still awaiting
    /// its delivery outcome.
    async fn has_in_flight(&self, content_type: &ContentType, id: &DocumentId) -> Result<bool> {
        let syncing = self
            .store
            .list_queue(&self.config.ship_id, Some(QueueStatus::Syncing))
            .await?;
        Ok(syncing
            .iter()
            .any(|entry| &entry.content_type == content_type && &entry.content_id == id))
    }

    /// Tell the master which local document holds its document, and at
    /// which master version. Best effort.
    async fn send_mapping_ack(
        &self,
        content_type: &ContentType,
        replica_id: &DocumentId,
        master_id: &DocumentId,
        version: i64,
    ) {
        let envelope = Envelope::new(
            self.config.ship_id.clone(),
            MessageBody::MappingAck(MappingAck {
                content_type: content_type.clone(),
                replica_document_id: replica_id.clone(),
                master_document_id: master_id.clone(),
                synced_at: (version > 0).then_some(version),
            }),
        );
        if let Err(e) = self.producer.send(Topic::ShipUpdates, &envelope).await {
            warn!(%content_type, %replica_id, %master_id, error = %e, "mapping-ack not sent");
        }
    }

    async fn apply_create_ack(&self, ack: &MappingAck) -> Result<()> {
        let ship_id = &self.config.ship_id;
        let Some(local) = self
            .content
            .find_one(&ack.content_type, &ack.replica_document_id)
            .await?
        else {
            debug!(
                content_type = %ack.content_type,
                replica_id = %ack.replica_document_id,
                "create ack for deleted document ignored"
            );
            return Ok(());
        };
        let synced_at = local.updated_at;
        self.store
            .set_mapping(
                ship_id,
                &ack.content_type,
                &ack.replica_document_id,
                &ack.master_document_id,
                SyncedBy::Ship,
                synced_at,
            )
            .await?;
        info!(
            content_type = %ack.content_type,
            replica_id = %ack.replica_document_id,
            master_id = %ack.master_document_id,
            "document mapped by master"
        );
        Ok(())
    }

    async fn apply_conflict_rejected(&self, notice: &ConflictNotice) -> Result<()> {
        let entry_id = match notice.queue_entry_id {
            Some(id) => Some(id),
            None => {
                self.latest_synced_entry(&notice.content_type, &notice.replica_document_id)
                    .await?
            }
        };
        match entry_id {
            Some(id) => {
                self.store
                    .mark_conflict_pending(id, notice.conflict_id, &notice.reason)
                    .await?;
                warn!(
                    conflict_id = notice.conflict_id,
                    queue_entry_id = id,
                    content_type = %notice.content_type,
                    reason = %notice.reason,
                    "change rejected by master, awaiting resolution"
                );
            }
            None => warn!(
                conflict_id = notice.conflict_id,
                replica_id = %notice.replica_document_id,
                "conflict notice matches no outbox entry"
            ),
        }
        Ok(())
    }

    async fn latest_synced_entry(
        &self,
        content_type: &ContentType,
        replica_id: &DocumentId,
    ) -> Result<Option<i64>> {
        let synced = self
            .store
            .list_queue(&self.config.ship_id, Some(QueueStatus::Synced))
            .await?;
        Ok(synced
            .iter()
            .rev()
            .find(|e| &e.content_type == content_type && &e.content_id == replica_id)
            .map(|e| e.id))
    }

    async fn apply_conflict_resolved(&self, notice: &ResolutionNotice) -> Result<()> {
        let ship_id = &self.config.ship_id;
        let content_type = &notice.content_type;

        let status = match notice.resolution {
            ResolutionStrategy::KeepShip => QueueStatus::ConflictAccepted,
            ResolutionStrategy::KeepMaster => QueueStatus::ConflictRejected,
            ResolutionStrategy::Merge => QueueStatus::ConflictMerged,
        };
        let parked = self
            .store
            .mark_conflict_outcome(notice.conflict_id, status)
            .await?;

        let replica_id = match &notice.replica_document_id {
            Some(id) => Some(id.clone()),
            None => self
                .store
                .find_by_master_id(ship_id, content_type, &notice.content_id)
                .await?
                .map(|m| m.replica_document_id),
        };
        let Some(replica_id) = replica_id else {
            warn!(conflict_id = notice.conflict_id, "resolved conflict for unmapped document");
            return Ok(());
        };

        let incoming = match notice.resolution {
            ResolutionStrategy::KeepShip => None,
            ResolutionStrategy::KeepMaster | ResolutionStrategy::Merge => Some(
                notice
                    .resolved_data
                    .clone()
                    .unwrap_or_else(|| notice.master_data.clone()),
            ),
        };
        let document = match incoming {
            Some(data) => Some(
                self.content
                    .update(content_type, &replica_id, data, Origin::Master)
                    .await?,
            ),
            None => self.content.find_one(content_type, &replica_id).await?,
        };

        if let Some(document) = document {
            self.store
                .set_mapping(
                    ship_id,
                    content_type,
                    &replica_id,
                    &notice.content_id,
                    SyncedBy::Master,
                    document.updated_at,
                )
                .await?;
        }

        info!(
            conflict_id = notice.conflict_id,
            resolution = notice.resolution.as_str(),
            entries = parked,
            "conflict resolved by master"
        );
        Ok(())
    }

    fn addressed_to_me(&self, envelope: &Envelope) -> bool {
        if envelope.ship_id == self.config.ship_id {
            return true;
        }
        debug!(
            target_ship = %envelope.ship_id,
            operation = envelope.operation(),
            "message for another ship ignored"
        );
        false
    }
}

#[async_trait]
impl<S, C, T> MessageHandler for ReplicaNode<S, C, T>
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
        Ok(self.apply_master_change(envelope, operation, change).await?)
    }

    async fn on_create_ack(&self, envelope: &Envelope, ack: &MappingAck) -> shipsync_sync::Result<()> {
        if !self.addressed_to_me(envelope) {
            return Ok(());
        }
        Ok(self.apply_create_ack(ack).await?)
    }

    async fn on_conflict_rejected(
        &self,
        envelope: &Envelope,
        notice: &ConflictNotice,
    ) -> shipsync_sync::Result<()> {
        if !self.addressed_to_me(envelope) {
            return Ok(());
        }
        Ok(self.apply_conflict_rejected(notice).await?)
    }

    async fn on_conflict_resolved(
        &self,
        envelope: &Envelope,
        notice: &ResolutionNotice,
    ) -> shipsync_sync::Result<()> {
        if !self.addressed_to_me(envelope) {
            return Ok(());
        }
        Ok(self.apply_conflict_resolved(notice).await?)
    }
}

#[async_trait]
impl<S, C, T> Pusher for ReplicaNode<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    async fn push_pending(&self) -> shipsync_sync::Result<usize> {
        ReplicaNode::push_pending(self).await.map_err(SyncError::from)
    }

    async fn has_pending(&self) -> bool {
        match ReplicaNode::has_pending(self).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not count pending entries");
                false
            }
        }
    }
}

/// A ship's sync engine.
///
/// Owns the replica's producer and consumer connections and its
/// background tasks: the consumer loop, push worker, connectivity monitor,
/// heartbeat, dead-letter sweep and maintenance.
pub struct ReplicaEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    node: Arc<ReplicaNode<S, C, T>>,
    consumer: Arc<T>,
    dispatcher: Arc<Dispatcher<S, ReplicaNode<S, C, T>>>,
    monitor: Arc<ConnectivityMonitor<T>>,
    push: Arc<Mutex<Option<PushHandle>>>,
    running: AsyncMutex<Option<Lifecycle>>,
}

impl<S, C, T> ReplicaEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    /// Create a replica engine.
    ///
    /// `producer` sends on `ship-updates`; `consumer` reads `master-updates`
    /// in a consumer group of its own.
    pub fn new(
        config: EngineConfig,
        store: Arc<S>,
        content: Arc<C>,
        producer: T,
        consumer: T,
    ) -> Result<Self> {
        if config.role != NodeRole::Replica {
            return Err(EngineError::Config(format!(
                "replica engine built with role {}",
                config.role
            )));
        }
        if config.ship_id.is_master() || config.ship_id.as_str().is_empty() {
            return Err(EngineError::Config(format!(
                "invalid ship id {:?}",
                config.ship_id.as_str()
            )));
        }

        let producer = Arc::new(ReliableProducer::new(producer, config.transport.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&producer),
            config.monitor.clone(),
        ));
        let node = Arc::new(ReplicaNode {
            filter: MutationFilter::new(config.excluded_content_prefixes.clone()),
            config,
            store: Arc::clone(&store),
            content,
            producer,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            Arc::clone(&node),
            node.config.dead_letter_max_retries,
        ));

        let push: Arc<Mutex<Option<PushHandle>>> = Arc::new(Mutex::new(None));
        let on_reconnect = Arc::clone(&push);
        monitor.on_reconnect(move || {
            if let Some(handle) = on_reconnect
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_ref()
            {
                handle.trigger();
            }
        });

        Ok(Self {
            node,
            consumer: Arc::new(consumer),
            dispatcher,
            monitor,
            push,
            running: AsyncMutex::new(None),
        })
    }

    pub fn node(&self) -> &Arc<ReplicaNode<S, C, T>> {
        &self.node
    }

    pub fn ship_id(&self) -> &ShipId {
        self.node.ship_id()
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

    /// Capture a local mutation and schedule a push.
    pub async fn handle_mutation(&self, mutation: &Mutation) -> Result<Option<SyncQueueEntry>> {
        let entry = self.node.record_mutation(mutation).await?;
        if entry.is_some() {
            self.trigger_push();
        }
        Ok(entry)
    }

    /// Request a debounced push. No-op before [`ReplicaEngine::start`].
    pub fn trigger_push(&self) {
        if let Some(handle) = self
            .push
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            handle.trigger();
        }
    }

    /// Push immediately, bypassing the debounce.
    pub async fn push_now(&self) -> Result<usize> {
        if !self.node.producer.is_connected() {
            if let Err(e) = self.node.producer.connect().await {
                debug!(error = %e, "connect before push failed");
            }
        }
        self.node.push_pending().await
    }

    /// Dispatch every delivery currently waiting on `master-updates`.
    pub async fn pump(&self, wait: Duration) -> Result<usize> {
        lifecycle::pump(
            self.dispatcher.as_ref(),
            self.consumer.as_ref(),
            &[Topic::MasterUpdates],
            wait,
        )
        .await
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

    /// Outbox entries, oldest first.
    pub async fn queue(&self, status: Option<QueueStatus>) -> Result<Vec<SyncQueueEntry>> {
        Ok(self.node.store.list_queue(self.ship_id(), status).await?)
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            mode: NodeRole::Replica,
            ship_id: self.ship_id().clone(),
            connected: self.node.producer.is_connected(),
            pending_count: self.node.store.pending_count(self.ship_id()).await?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Recover interrupted pushes and start the background tasks.
    ///
    /// An unreachable broker is not an error; the engine starts offline and
    /// catches up once the monitor sees the broker.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::InvalidOperation("replica already started".into()));
        }

        let config = &self.node.config;
        let requeued = self.node.store.requeue_in_flight(self.ship_id()).await?;
        if requeued > 0 {
            info!(requeued, "interrupted pushes returned to pending");
        }
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
                .run(consumer.as_ref(), &[Topic::MasterUpdates], poll_interval, shutdown)
                .await;
        }));

        let (handle, worker) = PushWorker::spawn(
            Arc::clone(&self.node),
            config.push.clone(),
            lifecycle.timer_signal(),
        );
        *self
            .push
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        lifecycle.add_timer(worker);

        lifecycle.add_timer(Arc::clone(&self.monitor).spawn(lifecycle.timer_signal()));
        lifecycle.add_timer(spawn_heartbeat(
            Arc::clone(&self.node.producer),
            config.ship_id.clone(),
            config.ship_name.clone(),
            config.heartbeat.interval,
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

        // Catch up on anything queued while the process was down.
        self.trigger_push();

        *running = Some(lifecycle);
        info!(ship_id = %config.ship_id, "replica engine started");
        Ok(())
    }

    /// Stop timers, then the consumer, then disconnect the producer.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(lifecycle) = self.running.lock().await.take() else {
            return Ok(());
        };
        lifecycle.stop().await;
        *self
            .push
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.node.producer.disconnect().await?;
        info!(ship_id = %self.ship_id(), "replica engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

#[async_trait]
impl<S, C, T> MutationHook for ReplicaEngine<S, C, T>
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
                "failed to queue local change"
            );
        }
    }
}
