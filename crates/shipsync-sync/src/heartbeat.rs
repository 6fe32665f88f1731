//! Replica heartbeats and the master's liveness sweep.
//!
//! Liveness is observational only; it never gates message acceptance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shipsync_core::{now_millis, Envelope, Heartbeat, MessageBody, ShipId};
use shipsync_store::Store;

use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::producer::ReliableProducer;
use crate::transport::{Topic, Transport};

/// Send one heartbeat if the transport is up. Returns whether one was sent.
pub async fn send_heartbeat<T: Transport>(
    producer: &ReliableProducer<T>,
    ship_id: &ShipId,
    ship_name: Option<&str>,
) -> Result<bool> {
    if !producer.is_connected() {
        return Ok(false);
    }
    let envelope = Envelope::new(
        ship_id.clone(),
        MessageBody::Heartbeat(Heartbeat {
            ship_name: ship_name.map(str::to_string),
        }),
    );
    producer.send(Topic::ShipUpdates, &envelope).await?;
    Ok(true)
}

/// Replica side: heartbeat every `interval` until shutdown.
pub fn spawn_heartbeat<T: Transport + 'static>(
    producer: Arc<ReliableProducer<T>>,
    ship_id: ShipId,
    ship_name: Option<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match send_heartbeat(&producer, &ship_id, ship_name.as_deref()).await {
                Ok(true) => debug!(%ship_id, "heartbeat sent"),
                Ok(false) => debug!(%ship_id, "heartbeat skipped, transport offline"),
                Err(e) => debug!(%ship_id, error = %e, "heartbeat failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

/// Master side: flip ships silent for `missed_intervals` heartbeats to offline.
pub async fn sweep_registry<S: Store>(store: &S, config: &HeartbeatConfig) -> Result<Vec<ShipId>> {
    let cutoff = now_millis() - config.stale_after().as_millis() as i64;
    let stale = store.mark_stale_offline(cutoff).await?;
    for ship_id in &stale {
        info!(%ship_id, "ship marked offline");
    }
    Ok(stale)
}

/// Run [`sweep_registry`] every `sweep_interval` until shutdown.
pub fn spawn_registry_sweep<S: Store + 'static>(
    store: Arc<S>,
    config: HeartbeatConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(config.sweep_interval) => {}
            }
            if let Err(e) = sweep_registry(store.as_ref(), &config).await {
                warn!(error = %e, "registry sweep failed");
            }
        }
    })
}
