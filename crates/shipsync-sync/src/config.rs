//! Tunables for the transport, push loop, connectivity probe and heartbeats.

use std::time::Duration;

/// Producer connection and retry behavior.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Upper bound on a single send or health check.
    pub request_timeout: Duration,
    /// Attempts per send before giving up.
    pub max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Replica push loop.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Quiet period after a trigger before pushing.
    pub debounce: Duration,
    /// Periodic check for entries that arrived without a trigger.
    pub auto_push_interval: Duration,
    /// Entries claimed per dequeue.
    pub batch_size: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            auto_push_interval: Duration::from_secs(30),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Replica heartbeat cadence and master liveness sweep.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub sweep_interval: Duration,
    /// A ship is offline after this many intervals without a heartbeat.
    pub missed_intervals: u32,
}

impl HeartbeatConfig {
    /// Silence after which a ship is considered offline.
    pub fn stale_after(&self) -> Duration {
        self.interval * self.missed_intervals
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            missed_intervals: 2,
        }
    }
}
