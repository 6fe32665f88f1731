//! Transport abstraction over a partitioned, persistent message log.
//!
//! Two logical topics carry all traffic: ships publish to `ship-updates`,
//! the master publishes to `master-updates`. Ship messages are keyed by ship
//! id so that one ship's messages land in one partition and keep their order.
//! Everything on `master-updates` shares the master's key, so a targeted
//! reply and a later broadcast about the same document arrive in send order.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use shipsync_core::{Envelope, ShipId};

use crate::error::Result;

/// Logical channel on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Replica -> master.
    ShipUpdates,
    /// Master -> replicas.
    MasterUpdates,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ShipUpdates => "ship-updates",
            Topic::MasterUpdates => "master-updates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ship-updates" => Some(Topic::ShipUpdates),
            "master-updates" => Some(Topic::MasterUpdates),
            _ => None,
        }
    }

    /// Partition key for an envelope sent on this topic.
    ///
    /// Ship messages use the sender. Master messages always use
    /// [`ShipId::MASTER`], including acks and notices addressed to one ship.
    pub fn partition_key<'a>(&self, envelope: &'a Envelope) -> &'a str {
        match self {
            Topic::ShipUpdates => envelope.ship_id.as_str(),
            Topic::MasterUpdates => ShipId::MASTER,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
}

/// Transport trait for producing and consuming broker messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection. Calling this on a live connection is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Drop the connection. Consumer offsets are kept by the broker.
    async fn disconnect(&self) -> Result<()>;

    /// Lightweight round-trip to the broker, independent of the main
    /// connection, to detect silently dead links.
    async fn health_check(&self) -> Result<()>;

    /// Whether the connection is believed to be live.
    fn is_connected(&self) -> bool;

    /// Append a message to `topic`, partitioned by `key`.
    async fn send(&self, topic: Topic, key: &str, payload: Bytes) -> Result<()>;

    /// Set the topics consumed by [`Transport::recv_timeout`].
    async fn subscribe(&self, topics: &[Topic]) -> Result<()>;

    /// Receive the next message from any subscribed topic.
    ///
    /// Returns None if the timeout expires before a message arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>>;
}

/// An in-memory broker for tests and single-process deployments.
///
/// Topics are split into partitions, each an append-only log. Consumers
/// belong to groups; a group's offsets live on the broker, so messages
/// published while a consumer is disconnected are delivered once it
/// reconnects.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{Mutex, Notify};

    use crate::error::SyncError;

    /// Partition count used by [`MemoryBroker::new`].
    pub const DEFAULT_PARTITIONS: u32 = 4;

    #[derive(Debug, Clone)]
    struct Record {
        key: String,
        payload: Bytes,
    }

    #[derive(Default)]
    struct BrokerState {
        /// topic -> partition -> log.
        logs: HashMap<Topic, Vec<Vec<Record>>>,
        /// (group, topic, partition) -> next offset to deliver.
        offsets: HashMap<(String, Topic, u32), u64>,
    }

    /// Shared broker state.
    pub struct MemoryBroker {
        partitions: u32,
        reachable: AtomicBool,
        state: Mutex<BrokerState>,
        notify: Notify,
    }

    impl MemoryBroker {
        /// Create a broker with [`DEFAULT_PARTITIONS`] partitions per topic.
        pub fn new() -> Arc<Self> {
            Self::with_partitions(DEFAULT_PARTITIONS)
        }

        pub fn with_partitions(partitions: u32) -> Arc<Self> {
            Arc::new(Self {
                partitions: partitions.max(1),
                reachable: AtomicBool::new(true),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            })
        }

        /// Create a transport whose consumer side belongs to `group`.
        pub fn create_transport(self: &Arc<Self>, group: impl Into<String>) -> MemoryTransport {
            MemoryTransport {
                broker: Arc::clone(self),
                group: group.into(),
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                cursor: AtomicUsize::new(0),
            }
        }

        /// Simulate an outage (`false`) or recovery (`true`).
        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        /// Partition for a message key: blake3 of the key, mod partitions.
        pub fn partition_for(&self, key: &str) -> u32 {
            let hash = blake3::hash(key.as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&hash.as_bytes()[..8]);
            (u64::from_le_bytes(prefix) % u64::from(self.partitions)) as u32
        }

        /// Reset a group's offsets on a topic so every message is delivered again.
        pub async fn rewind(&self, group: &str, topic: Topic) {
            let mut state = self.state.lock().await;
            state
                .offsets
                .retain(|(g, t, _), _| !(g == group && *t == topic));
            drop(state);
            self.notify.notify_waiters();
        }

        /// Every payload on a topic, in partition then offset order.
        pub async fn messages(&self, topic: Topic) -> Vec<Bytes> {
            let state = self.state.lock().await;
            state
                .logs
                .get(&topic)
                .map(|parts| {
                    parts
                        .iter()
                        .flat_map(|log| log.iter().map(|r| r.payload.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }

        async fn append(&self, topic: Topic, key: &str, payload: Bytes) {
            let partition = self.partition_for(key) as usize;
            let mut state = self.state.lock().await;
            let partitions = self.partitions as usize;
            let logs = state
                .logs
                .entry(topic)
                .or_insert_with(|| vec![Vec::new(); partitions]);
            logs[partition].push(Record {
                key: key.to_string(),
                payload,
            });
            drop(state);
            self.notify.notify_waiters();
        }

        async fn poll(&self, group: &str, topics: &[Topic], start: usize) -> Option<Delivery> {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let slots: Vec<(Topic, u32)> = topics
                .iter()
                .flat_map(|t| (0..self.partitions).map(move |p| (*t, p)))
                .collect();
            if slots.is_empty() {
                return None;
            }

            for i in 0..slots.len() {
                let (topic, partition) = slots[(start + i) % slots.len()];
                let Some(log) = state
                    .logs
                    .get(&topic)
                    .and_then(|parts| parts.get(partition as usize))
                else {
                    continue;
                };
                let offset = state
                    .offsets
                    .entry((group.to_string(), topic, partition))
                    .or_insert(0);
                if let Some(record) = log.get(*offset as usize) {
                    let delivery = Delivery {
                        topic,
                        partition,
                        offset: *offset,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    };
                    *offset += 1;
                    return Some(delivery);
                }
            }
            None
        }
    }

    /// In-memory transport connected to a [`MemoryBroker`].
    pub struct MemoryTransport {
        broker: Arc<MemoryBroker>,
        group: String,
        connected: AtomicBool,
        subscriptions: Mutex<Vec<Topic>>,
        cursor: AtomicUsize,
    }

    impl MemoryTransport {
        pub fn group(&self) -> &str {
            &self.group
        }

        fn ensure_live(&self) -> Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(SyncError::NotConnected);
            }
            if !self.broker.is_reachable() {
                self.connected.store(false, Ordering::SeqCst);
                return Err(SyncError::TransportError("connection to broker lost".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> Result<()> {
            if !self.broker.is_reachable() {
                return Err(SyncError::TransportError("broker unreachable".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            if self.broker.is_reachable() {
                Ok(())
            } else {
                Err(SyncError::TransportError("broker unreachable".into()))
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst) && self.broker.is_reachable()
        }

        async fn send(&self, topic: Topic, key: &str, payload: Bytes) -> Result<()> {
            self.ensure_live()?;
            self.broker.append(topic, key, payload).await;
            Ok(())
        }

        async fn subscribe(&self, topics: &[Topic]) -> Result<()> {
            *self.subscriptions.lock().await = topics.to_vec();
            Ok(())
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>> {
            let deadline = tokio::time::Instant::now() + timeout;
            let topics = self.subscriptions.lock().await.clone();

            loop {
                self.ensure_live()?;

                // Register interest before polling so an append in between
                // is not missed.
                let notified = self.broker.notify.notified();
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                if let Some(delivery) = self.broker.poll(&self.group, &topics, start).await {
                    return Ok(Some(delivery));
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBroker;
    use super::*;
    use crate::error::SyncError;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let broker = MemoryBroker::new();
        let producer = broker.create_transport("ship-1");
        let consumer = broker.create_transport("master");

        producer.connect().await.unwrap();
        consumer.connect().await.unwrap();
        consumer.subscribe(&[Topic::ShipUpdates]).await.unwrap();

        producer
            .send(Topic::ShipUpdates, "ship-1", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let delivery = consumer.recv_timeout(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.topic, Topic::ShipUpdates);
        assert_eq!(delivery.key, "ship-1");
        assert_eq!(&delivery.payload[..], b"hello");

        assert!(consumer.recv_timeout(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_per_key_order_preserved() {
        let broker = MemoryBroker::new();
        let producer = broker.create_transport("ship-1");
        let consumer = broker.create_transport("master");
        producer.connect().await.unwrap();
        consumer.connect().await.unwrap();
        consumer.subscribe(&[Topic::ShipUpdates]).await.unwrap();

        for i in 0..20u8 {
            producer
                .send(Topic::ShipUpdates, "ship-1", Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        producer
            .send(Topic::ShipUpdates, "ship-2", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(d) = consumer.recv_timeout(Duration::from_millis(20)).await.unwrap() {
            if d.key == "ship-1" {
                seen.push(d.payload[0]);
            }
        }
        assert_eq!(seen, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_retention_while_consumer_offline() {
        let broker = MemoryBroker::new();
        let producer = broker.create_transport("master-producer");
        producer.connect().await.unwrap();

        producer
            .send(Topic::MasterUpdates, "master", Bytes::from_static(b"m1"))
            .await
            .unwrap();

        // Consumer group joins later and still sees the message.
        let consumer = broker.create_transport("ship-1");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[Topic::MasterUpdates]).await.unwrap();
        let d = consumer.recv_timeout(WAIT).await.unwrap().unwrap();
        assert_eq!(&d.payload[..], b"m1");

        // Offsets survive a reconnect.
        consumer.disconnect().await.unwrap();
        consumer.connect().await.unwrap();
        assert!(consumer.recv_timeout(Duration::from_millis(20)).await.unwrap().is_none());

        broker.rewind("ship-1", Topic::MasterUpdates).await;
        assert!(consumer.recv_timeout(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_broker_drops_connection() {
        let broker = MemoryBroker::new();
        let producer = broker.create_transport("ship-1");
        producer.connect().await.unwrap();

        broker.set_reachable(false);
        assert!(!producer.is_connected());
        let err = producer
            .send(Topic::ShipUpdates, "ship-1", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(producer.health_check().await.is_err());
        assert!(matches!(producer.connect().await, Err(SyncError::TransportError(_))));

        broker.set_reachable(true);
        producer.connect().await.unwrap();
        producer
            .send(Topic::ShipUpdates, "ship-1", Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let broker = MemoryBroker::new();
        let consumer = broker.create_transport("master");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[Topic::ShipUpdates]).await.unwrap();

        let producer = broker.create_transport("ship-1");
        producer.connect().await.unwrap();
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer
                .send(Topic::ShipUpdates, "ship-1", Bytes::from_static(b"late"))
                .await
                .unwrap();
        });

        let d = consumer.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(&d.unwrap().payload[..], b"late");
        sender.await.unwrap();
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::parse("ship-updates"), Some(Topic::ShipUpdates));
        assert_eq!(Topic::MasterUpdates.to_string(), "master-updates");
        assert_eq!(Topic::parse("other"), None);
    }
}
