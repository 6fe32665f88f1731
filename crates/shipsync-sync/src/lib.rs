//! # shipsync Sync
//!
//! Moving messages between the master and its replicas.
//!
//! ## Overview
//!
//! - [`Transport`] abstracts a partitioned, persistent message log;
//!   [`MemoryBroker`] implements it in memory.
//! - [`ReliableProducer`] adds reconnects, timeouts and bounded retries.
//! - [`Dispatcher`] decodes inbound messages, applies the idempotency gate
//!   and routes each operation to a [`MessageHandler`]; failures go to the
//!   [`DeadLetterQueue`].
//! - [`ConnectivityMonitor`] probes the broker and fires reconnect callbacks.
//! - [`PushWorker`] runs the debounced, single-flight replica push loop.
//!
//! ## Message Flow
//!
//! ```text
//! Replica                                   Master
//!   |-- create/update/delete (ship-updates) -->|
//!   |<----------- create-ack ------------------|  (new document)
//!   |<---------- conflict-rejected ------------|  (master edited since last sync)
//!   |<---------- conflict-resolved ------------|  (operator decision)
//!   |<-- create/update/delete (master-updates)-|  (master-authored edits)
//!   |------------ mapping-ack ---------------->|
//!   |------------ heartbeat ------------------>|
//! ```

pub mod config;
pub mod conflict;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod producer;
pub mod push;
pub mod tracker;
pub mod transport;

pub use config::{HeartbeatConfig, MonitorConfig, PushConfig, TransportConfig};
pub use conflict::{ConflictCheck, ConflictDetector};
pub use dead_letter::{DeadLetterQueue, RETRY_SWEEP};
pub use dispatcher::{DispatchOutcome, Dispatcher, MessageHandler, RetryReport};
pub use error::{Result, SyncError};
pub use heartbeat::{send_heartbeat, spawn_heartbeat, spawn_registry_sweep, sweep_registry};
pub use monitor::{ConnectivityMonitor, ConnectivityState};
pub use producer::ReliableProducer;
pub use push::{PushHandle, PushWorker, Pusher};
pub use tracker::MessageTracker;
pub use transport::{
    memory::MemoryBroker, memory::MemoryTransport, Delivery, Topic, Transport,
};
