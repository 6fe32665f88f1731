//! Connectivity monitor.
//!
//! `offline -> (probe succeeds) -> online -> (probe fails) -> offline`.
//! Entering `online` fires the registered reconnect callbacks, which is how
//! replicas start their catch-up push and the master flushes its outbound
//! buffer.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::producer::ReliableProducer;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Offline,
    Online,
}

type ReconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Periodically probes the broker through the producer.
pub struct ConnectivityMonitor<T: Transport> {
    producer: Arc<ReliableProducer<T>>,
    config: MonitorConfig,
    state: watch::Sender<ConnectivityState>,
    callbacks: Mutex<Vec<ReconnectCallback>>,
}

impl<T: Transport + 'static> ConnectivityMonitor<T> {
    pub fn new(producer: Arc<ReliableProducer<T>>, config: MonitorConfig) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Offline);
        Self {
            producer,
            config,
            state,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback fired on every `offline -> online` transition.
    pub fn on_reconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Reconnect if needed, then health-check; update state accordingly.
    pub async fn probe(&self) -> ConnectivityState {
        let reachable = match self.producer.connect().await {
            Ok(()) => self.producer.health_check().await.is_ok(),
            Err(_) => false,
        };
        let next = if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };

        let previous = self.state.send_replace(next);
        match (previous, next) {
            (ConnectivityState::Offline, ConnectivityState::Online) => {
                info!("transport online");
                let callbacks = self
                    .callbacks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for callback in callbacks.iter() {
                    callback();
                }
            }
            (ConnectivityState::Online, ConnectivityState::Offline) => {
                warn!("transport offline");
            }
            _ => {}
        }
        next
    }

    /// Probe immediately, then every `probe_interval` until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.probe().await;
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.probe_interval) => {}
                }
            }
        })
    }
}
