//! Background task bookkeeping shared by both engine roles.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shipsync_core::{NodeRole, ShipId};
use shipsync_store::Store;
use shipsync_sync::{Dispatcher, MessageHandler, MessageTracker, Topic, Transport};

use crate::error::Result;

/// Snapshot reported by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub mode: NodeRole,
    pub ship_id: ShipId,
    pub connected: bool,
    /// Outbox entries awaiting push on a replica, buffered broadcasts on the
    /// master.
    pub pending_count: usize,
}

/// Tasks of a started engine.
///
/// Timers stop first, then the consumer; the caller disconnects the
/// producer last.
pub(crate) struct Lifecycle {
    timers_tx: watch::Sender<bool>,
    consumer_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (timers_tx, _) = watch::channel(false);
        let (consumer_tx, _) = watch::channel(false);
        Self {
            timers_tx,
            consumer_tx,
            timers: Vec::new(),
            consumer: None,
        }
    }

    pub(crate) fn timer_signal(&self) -> watch::Receiver<bool> {
        self.timers_tx.subscribe()
    }

    pub(crate) fn consumer_signal(&self) -> watch::Receiver<bool> {
        self.consumer_tx.subscribe()
    }

    pub(crate) fn add_timer(&mut self, task: JoinHandle<()>) {
        self.timers.push(task);
    }

    pub(crate) fn set_consumer(&mut self, task: JoinHandle<()>) {
        self.consumer = Some(task);
    }

    pub(crate) async fn stop(self) {
        self.timers_tx.send_replace(true);
        for task in self.timers {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.consumer_tx.send_replace(true);
        if let Some(task) = self.consumer {
            if let Err(e) = task.await {
                warn!(error = %e, "consumer task ended abnormally");
            }
        }
    }
}

/// Dispatch everything currently available on `topics`, waiting up to
/// `wait` for each next message. Returns the number of deliveries handled.
///
/// Meant for stepping an engine that was not started.
pub(crate) async fn pump<S, H, T>(
    dispatcher: &Dispatcher<S, H>,
    consumer: &T,
    topics: &[Topic],
    wait: Duration,
) -> Result<usize>
where
    S: Store + 'static,
    H: MessageHandler + 'static,
    T: Transport,
{
    if !consumer.is_connected() {
        consumer.connect().await?;
    }
    consumer.subscribe(topics).await?;

    let mut handled = 0;
    while let Some(delivery) = consumer.recv_timeout(wait).await? {
        let outcome = dispatcher.dispatch(&delivery.payload).await?;
        debug!(topic = %delivery.topic, offset = delivery.offset, ?outcome, "pumped delivery");
        handled += 1;
    }
    Ok(handled)
}

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_messages: usize,
    pub cleaned_entries: usize,
}

/// Drop idempotency records and synced outbox entries older than `retention`.
pub async fn run_maintenance<S: Store>(
    tracker: &MessageTracker<S>,
    store: &S,
    retention: Duration,
) -> Result<MaintenanceReport> {
    let pruned_messages = tracker.prune(retention).await?;
    let cutoff = shipsync_core::now_millis() - retention.as_millis() as i64;
    let cleaned_entries = store.cleanup_synced(cutoff).await?;
    Ok(MaintenanceReport {
        pruned_messages,
        cleaned_entries,
    })
}

pub(crate) fn spawn_maintenance<S: Store + 'static>(
    tracker: MessageTracker<S>,
    store: std::sync::Arc<S>,
    interval: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match run_maintenance(&tracker, store.as_ref(), retention).await {
                Ok(report) if report != MaintenanceReport::default() => {
                    info!(?report, "maintenance finished");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "maintenance failed"),
            }
        }
    })
}
