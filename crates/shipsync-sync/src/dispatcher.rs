//! Inbound message dispatch.
//!
//! Every delivery goes through the same pipeline:
//!
//! ```text
//! bytes -> decode -> validate -> idempotency gate -> route by operation
//!                                                      |
//!                                        error -> dead letter + mark failed
//! ```
//!
//! Nothing that happens while applying a message escapes the consumer loop;
//! failures are recorded in the dead-letter store for replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shipsync_core::{
    ConflictNotice, ContentChange, DeadLetterStatus, Envelope, Heartbeat, MappingAck,
    MessageBody, Operation, ResolutionNotice,
};
use shipsync_store::Store;

use crate::dead_letter::{DeadLetterQueue, RETRY_SWEEP};
use crate::error::{Result, SyncError};
use crate::tracker::MessageTracker;
use crate::transport::{Topic, Transport};

/// Handles decoded, validated, first-seen messages.
///
/// Only content changes must be handled; the other kinds are ignored
/// unless a node overrides them. An `Err` sends the message to the
/// dead-letter store.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_content(
        &self,
        envelope: &Envelope,
        operation: Operation,
        change: &ContentChange,
    ) -> Result<()>;

    async fn on_heartbeat(&self, envelope: &Envelope, _heartbeat: &Heartbeat) -> Result<()> {
        debug!(ship_id = %envelope.ship_id, "ignoring heartbeat");
        Ok(())
    }

    async fn on_mapping_ack(&self, envelope: &Envelope, _ack: &MappingAck) -> Result<()> {
        debug!(message_id = %envelope.message_id, "ignoring mapping-ack");
        Ok(())
    }

    async fn on_create_ack(&self, envelope: &Envelope, _ack: &MappingAck) -> Result<()> {
        debug!(message_id = %envelope.message_id, "ignoring create-ack");
        Ok(())
    }

    async fn on_conflict_rejected(
        &self,
        envelope: &Envelope,
        _notice: &ConflictNotice,
    ) -> Result<()> {
        debug!(message_id = %envelope.message_id, "ignoring conflict-rejected");
        Ok(())
    }

    async fn on_conflict_resolved(
        &self,
        envelope: &Envelope,
        _notice: &ResolutionNotice,
    ) -> Result<()> {
        debug!(message_id = %envelope.message_id, "ignoring conflict-resolved");
        Ok(())
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// Already seen; dropped without side effects.
    Duplicate,
    DeadLettered,
}

/// Summary of one dead-letter retry sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Routes inbound messages to a [`MessageHandler`].
pub struct Dispatcher<S: Store, H: MessageHandler> {
    handler: Arc<H>,
    tracker: MessageTracker<S>,
    dead_letters: DeadLetterQueue<S>,
}

impl<S: Store + 'static, H: MessageHandler + 'static> Dispatcher<S, H> {
    pub fn new(store: Arc<S>, handler: Arc<H>, dead_letter_max_retries: u32) -> Self {
        Self {
            handler,
            tracker: MessageTracker::new(Arc::clone(&store)),
            dead_letters: DeadLetterQueue::new(store, dead_letter_max_retries),
        }
    }

    pub fn tracker(&self) -> &MessageTracker<S> {
        &self.tracker
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue<S> {
        &self.dead_letters
    }

    /// Process one raw delivery.
    ///
    /// Returns `Err` only when the bookkeeping itself (tracker, dead-letter
    /// store) fails.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<DispatchOutcome> {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable message");
                self.dead_letters
                    .add_undecodable(payload, &e.to_string())
                    .await?;
                return Ok(DispatchOutcome::DeadLettered);
            }
        };

        if self.tracker.is_processed(&envelope.message_id).await? {
            warn!(
                message_id = %envelope.message_id,
                ship_id = %envelope.ship_id,
                operation = envelope.operation(),
                "duplicate message dropped"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        let result = match envelope.validate() {
            Ok(()) => self.route(&envelope).await,
            Err(e) => Err(SyncError::from(e)),
        };

        match result {
            Ok(()) => {
                self.tracker.mark_processed(&envelope.message_id).await?;
                Ok(DispatchOutcome::Applied)
            }
            Err(e) => {
                self.dead_letters
                    .add_envelope(&envelope, &e.to_string())
                    .await?;
                self.tracker.mark_failed(&envelope.message_id).await?;
                Ok(DispatchOutcome::DeadLettered)
            }
        }
    }

    /// Route a message to the handler method for its operation.
    pub async fn route(&self, envelope: &Envelope) -> Result<()> {
        debug!(
            message_id = %envelope.message_id,
            ship_id = %envelope.ship_id,
            operation = envelope.operation(),
            "dispatching"
        );

        match &envelope.body {
            MessageBody::Create(change) => {
                self.handler.on_content(envelope, Operation::Create, change).await
            }
            MessageBody::Update(change) => {
                self.handler.on_content(envelope, Operation::Update, change).await
            }
            MessageBody::Delete(change) => {
                self.handler.on_content(envelope, Operation::Delete, change).await
            }
            MessageBody::Heartbeat(hb) => self.handler.on_heartbeat(envelope, hb).await,
            MessageBody::MappingAck(ack) => self.handler.on_mapping_ack(envelope, ack).await,
            MessageBody::CreateAck(ack) => self.handler.on_create_ack(envelope, ack).await,
            MessageBody::ConflictRejected(notice) => {
                self.handler.on_conflict_rejected(envelope, notice).await
            }
            MessageBody::ConflictResolved(notice) => {
                self.handler.on_conflict_resolved(envelope, notice).await
            }
        }
    }

    /// Replay dead letters that still have retry budget.
    ///
    /// Replays bypass the idempotency gate: the message was recorded as
    /// failed, not applied.
    pub async fn retry_dead_letters(&self, limit: usize) -> Result<RetryReport> {
        let mut report = RetryReport::default();

        for pending in self.dead_letters.get_pending(limit).await? {
            let entry = self.dead_letters.mark_retrying(pending.id).await?;
            if entry.status != DeadLetterStatus::Retrying {
                report.exhausted += 1;
                continue;
            }
            report.attempted += 1;

            let replay = serde_json::from_value::<Envelope>(entry.payload.clone())
                .map_err(|e| SyncError::InvalidMessage(e.to_string()));
            let result = match replay {
                Ok(envelope) => match envelope.validate() {
                    Ok(()) => self.route(&envelope).await.map(|()| envelope),
                    Err(e) => Err(SyncError::from(e)),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(envelope) => {
                    self.dead_letters.mark_resolved(entry.id, RETRY_SWEEP).await?;
                    self.tracker.mark_recovered(&envelope.message_id).await?;
                    info!(dead_letter_id = entry.id, message_id = %envelope.message_id, "dead letter replayed");
                    report.resolved += 1;
                }
                Err(e) => {
                    warn!(
                        dead_letter_id = entry.id,
                        retry = entry.retry_count,
                        error = %e,
                        "dead letter replay failed"
                    );
                    self.dead_letters.record_error(entry.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Consume `topics` until shutdown.
    ///
    /// Messages are handled one at a time. A lost connection is retried
    /// every `poll_interval`; the broker keeps the group's offsets meanwhile.
    pub async fn run<T: Transport>(
        &self,
        consumer: &T,
        topics: &[Topic],
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut subscribed = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !consumer.is_connected() || !subscribed {
                let connected = match consumer.connect().await {
                    Ok(()) => consumer.subscribe(topics).await,
                    Err(e) => Err(e),
                };
                match connected {
                    Ok(()) => {
                        if !subscribed {
                            info!(?topics, "consumer subscribed");
                        }
                        subscribed = true;
                    }
                    Err(e) => {
                        debug!(error = %e, "consumer connect failed");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                received = consumer.recv_timeout(poll_interval) => match received {
                    Ok(Some(delivery)) => {
                        if let Err(e) = self.dispatch(&delivery.payload).await {
                            warn!(
                                topic = %delivery.topic,
                                partition = delivery.partition,
                                offset = delivery.offset,
                                error = %e,
                                "failed to record dispatch outcome"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "consumer receive failed"),
                }
            }
        }

        if let Err(e) = consumer.disconnect().await {
            debug!(error = %e, "consumer disconnect failed");
        }
    }

    /// Periodically run [`Dispatcher::retry_dead_letters`] until shutdown.
    pub fn spawn_retry_sweep(
        self: Arc<Self>,
        interval: Duration,
        limit: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.retry_dead_letters(limit).await {
                    Ok(report) if report != RetryReport::default() => {
                        info!(?report, "dead letter sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dead letter sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipsync_core::{ContentType, DocumentId, ShipId};
    use shipsync_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts content messages; fails while `fail` is set.
    #[derive(Default)]
    struct CountingHandler {
        applied: AtomicUsize,
        attempts: AtomicUsize,
        heartbeats: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn on_content(
            &self,
            _envelope: &Envelope,
            _operation: Operation,
            _change: &ContentChange,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Handler("validation error: title required".into()));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_heartbeat(&self, _envelope: &Envelope, _hb: &Heartbeat) -> Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn update() -> Envelope {
        Envelope::new(
            ShipId::new("ship-1"),
            MessageBody::Update(ContentChange {
                content_type: ContentType::new("api::article.article"),
                content_id: DocumentId::new("r-1"),
                version: 1,
                data: Some(json!({"title": "t"})),
                metadata: None,
            }),
        )
    }

    fn setup() -> (Arc<MemoryStore>, Arc<CountingHandler>, Dispatcher<MemoryStore, CountingHandler>) {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler::default());
        let dispatcher = Dispatcher::new(store.clone(), handler.clone(), 3);
        (store, handler, dispatcher)
    }

    #[tokio::test]
    async fn test_duplicate_applied_once() {
        let (_store, handler, dispatcher) = setup();
        let bytes = update().encode().unwrap();

        assert_eq!(dispatcher.dispatch(&bytes).await.unwrap(), DispatchOutcome::Applied);
        assert_eq!(dispatcher.dispatch(&bytes).await.unwrap(), DispatchOutcome::Duplicate);
        assert_eq!(handler.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_routes_by_operation() {
        let (_store, handler, dispatcher) = setup();
        let hb = Envelope::new(ShipId::new("ship-1"), MessageBody::Heartbeat(Heartbeat::default()));

        dispatcher.dispatch(&hb.encode().unwrap()).await.unwrap();
        assert_eq!(handler.heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(handler.applied.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_garbage_is_dead_lettered() {
        let (store, _handler, dispatcher) = setup();

        let outcome = dispatcher.dispatch(b"{not json").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(store.list_dead_letters(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_is_dead_lettered() {
        let (store, handler, dispatcher) = setup();
        let mut envelope = update();
        if let MessageBody::Update(change) = &mut envelope.body {
            change.data = None;
        }

        let outcome = dispatcher.dispatch(&envelope.encode().unwrap()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(store.list_dead_letters(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_exhausts_after_three_throws() {
        let (store, handler, dispatcher) = setup();
        handler.fail.store(true, Ordering::SeqCst);
        let bytes = update().encode().unwrap();

        // First throw on delivery.
        assert_eq!(dispatcher.dispatch(&bytes).await.unwrap(), DispatchOutcome::DeadLettered);
        // Two replays throw again, the third sweep exhausts the entry.
        let r1 = dispatcher.retry_dead_letters(10).await.unwrap();
        let r2 = dispatcher.retry_dead_letters(10).await.unwrap();
        let r3 = dispatcher.retry_dead_letters(10).await.unwrap();
        assert_eq!((r1.failed, r2.failed, r3.exhausted), (1, 1, 1));
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

        let entries = store.list_dead_letters(None, 10).await.unwrap();
        assert_eq!(entries[0].status, DeadLetterStatus::Exhausted);

        // Redelivery of the original message is not reprocessed.
        assert_eq!(dispatcher.dispatch(&bytes).await.unwrap(), DispatchOutcome::Duplicate);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_replay_resolves() {
        let (store, handler, dispatcher) = setup();
        handler.fail.store(true, Ordering::SeqCst);
        let envelope = update();
        dispatcher.dispatch(&envelope.encode().unwrap()).await.unwrap();

        handler.fail.store(false, Ordering::SeqCst);
        let report = dispatcher.retry_dead_letters(10).await.unwrap();
        assert_eq!(report.resolved, 1);

        let entry = &store.list_dead_letters(None, 10).await.unwrap()[0];
        assert_eq!(entry.status, DeadLetterStatus::Resolved);
        assert_eq!(entry.resolved_by.as_deref(), Some(RETRY_SWEEP));
        assert_eq!(handler.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_consumes_until_shutdown() {
        use crate::transport::memory::MemoryBroker;

        let (_store, handler, dispatcher) = setup();
        let broker = MemoryBroker::new();
        let producer = broker.create_transport("ship-1");
        producer.connect().await.unwrap();
        producer
            .send(Topic::ShipUpdates, "ship-1", update().encode().unwrap())
            .await
            .unwrap();

        let consumer = broker.create_transport("master");
        let (tx, rx) = watch::channel(false);
        let dispatcher = Arc::new(dispatcher);
        let d = dispatcher.clone();
        let task = tokio::spawn(async move {
            d.run(&consumer, &[Topic::ShipUpdates], Duration::from_millis(10), rx)
                .await;
        });

        for _ in 0..100 {
            if handler.applied.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.applied.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
