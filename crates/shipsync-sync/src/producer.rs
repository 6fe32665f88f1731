//! Reliable producer: reconnect, bounded timeouts and linear-backoff retries
//! on top of a raw [`Transport`].

use bytes::Bytes;
use tracing::{debug, warn};

use shipsync_core::Envelope;

use crate::config::TransportConfig;
use crate::error::{Result, SyncError};
use crate::transport::{Topic, Transport};

/// Producer wrapper that survives broker restarts.
pub struct ReliableProducer<T: Transport> {
    transport: T,
    config: TransportConfig,
}

impl<T: Transport> ReliableProducer<T> {
    pub fn new(transport: T, config: TransportConfig) -> Self {
        Self { transport, config }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Ensure a healthy connection.
    ///
    /// A live, healthy connection is left alone. Otherwise the stale client
    /// is torn down and a fresh connection is made within `connect_timeout`.
    pub async fn connect(&self) -> Result<()> {
        if self.transport.is_connected() && self.health_check().await.is_ok() {
            return Ok(());
        }

        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "ignoring error while dropping stale connection");
        }

        match tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "connect exceeded {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Broker round-trip bounded by `request_timeout`.
    pub async fn health_check(&self) -> Result<()> {
        match tokio::time::timeout(self.config.request_timeout, self.transport.health_check())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout("health check".into())),
        }
    }

    /// Encode and send an envelope under the topic's partition key.
    ///
    /// Encoding errors are returned immediately; they would fail on every
    /// attempt.
    pub async fn send(&self, topic: Topic, envelope: &Envelope) -> Result<()> {
        let payload = envelope.encode()?;
        self.send_bytes(topic, topic.partition_key(envelope), payload)
            .await
    }

    /// Send an already encoded payload, retrying transport faults.
    ///
    /// Attempt `n` that fails with a transport error waits
    /// `n * retry_backoff`, reconnects and tries again, up to `max_retries`
    /// attempts in total.
    pub async fn send_bytes(&self, topic: Topic, key: &str, payload: Bytes) -> Result<()> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let result = self.try_send(topic, key, payload.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() && attempt < max_attempts => {
                    let backoff = self.config.retry_backoff * attempt;
                    warn!(
                        %topic,
                        key,
                        attempt,
                        max_attempts,
                        error = %e,
                        "send failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_send(&self, topic: Topic, key: &str, payload: Bytes) -> Result<()> {
        if !self.transport.is_connected() {
            self.connect().await?;
        }
        match tokio::time::timeout(
            self.config.request_timeout,
            self.transport.send(topic, key, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!("send to {}", topic))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use shipsync_core::{
        ContentChange, ContentType, DocumentId, Heartbeat, MappingAck, MessageBody, ShipId,
    };
    use std::time::Duration;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
            max_retries: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn heartbeat() -> Envelope {
        Envelope::new(ShipId::new("ship-1"), MessageBody::Heartbeat(Heartbeat::default()))
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let producer = ReliableProducer::new(broker.create_transport("ship-1"), fast_config());

        producer.connect().await.unwrap();
        producer.connect().await.unwrap();
        assert!(producer.is_connected());
    }

    #[tokio::test]
    async fn test_send_reconnects_lazily() {
        let broker = MemoryBroker::new();
        let producer = ReliableProducer::new(broker.create_transport("ship-1"), fast_config());

        // Never connected explicitly.
        producer.send(Topic::ShipUpdates, &heartbeat()).await.unwrap();
        assert_eq!(broker.messages(Topic::ShipUpdates).await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_gives_up_after_max_retries() {
        let broker = MemoryBroker::new();
        let producer = ReliableProducer::new(broker.create_transport("ship-1"), fast_config());
        broker.set_reachable(false);

        let err = producer.send(Topic::ShipUpdates, &heartbeat()).await.unwrap_err();
        assert!(err.is_transport());
        assert!(broker.messages(Topic::ShipUpdates).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_recovers_when_broker_returns() {
        let broker = MemoryBroker::new();
        let config = TransportConfig {
            retry_backoff: Duration::from_millis(30),
            ..fast_config()
        };
        let producer = ReliableProducer::new(broker.create_transport("ship-1"), config);
        producer.connect().await.unwrap();
        broker.set_reachable(false);

        let b = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            b.set_reachable(true);
        });

        producer.send(Topic::ShipUpdates, &heartbeat()).await.unwrap();
        assert_eq!(broker.messages(Topic::ShipUpdates).await.len(), 1);
    }

    #[tokio::test]
    async fn test_master_replies_share_the_broadcast_partition() {
        let broker = MemoryBroker::new();
        assert_ne!(broker.partition_for("ship-1"), broker.partition_for("master"));

        let producer =
            ReliableProducer::new(broker.create_transport("master-producer"), fast_config());
        let article = ContentType::new("api::article.article");
        let ack = Envelope::new(
            ShipId::new("ship-1"),
            MessageBody::CreateAck(MappingAck {
                content_type: article.clone(),
                replica_document_id: DocumentId::new("r-1"),
                master_document_id: DocumentId::new("m-1"),
                synced_at: Some(10),
            }),
        );
        let broadcast = Envelope::new(
            ShipId::master(),
            MessageBody::Update(ContentChange {
                content_type: article,
                content_id: DocumentId::new("m-1"),
                version: 11,
                data: Some(serde_json::json!({"title": "edited"})),
                metadata: None,
            }),
        );
        producer.send(Topic::MasterUpdates, &ack).await.unwrap();
        producer.send(Topic::MasterUpdates, &broadcast).await.unwrap();

        let consumer = broker.create_transport("ship-1");
        consumer.connect().await.unwrap();
        consumer.subscribe(&[Topic::MasterUpdates]).await.unwrap();
        let first = consumer
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let second = consumer
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.key, "master");
        assert_eq!(first.partition, second.partition);
        assert_eq!(Envelope::decode(&first.payload).unwrap().operation(), "create-ack");
        assert_eq!(Envelope::decode(&second.payload).unwrap().operation(), "update");
    }

    #[test]
    fn test_ship_messages_keyed_by_sender() {
        assert_eq!(Topic::ShipUpdates.partition_key(&heartbeat()), "ship-1");
        assert_eq!(Topic::MasterUpdates.partition_key(&heartbeat()), "master");
    }
}
