//! Dead-letter queue: inbound messages whose processing failed.

use std::sync::Arc;

use serde_json::Value;

use shipsync_core::{
    now_millis, DeadLetterEntry, DeadLetterStatus, Envelope, MessageId, NewDeadLetter,
};
use shipsync_store::Store;

use crate::error::Result;

/// Resolver name recorded when a replay succeeds.
pub const RETRY_SWEEP: &str = "retry-sweep";

/// Thin policy layer over the dead-letter records of a [`Store`].
pub struct DeadLetterQueue<S: Store> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: Store> Clone for DeadLetterQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_retries: self.max_retries,
        }
    }
}

impl<S: Store> DeadLetterQueue<S> {
    pub fn new(store: Arc<S>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Record a decoded message that failed, with its full envelope.
    pub async fn add_envelope(&self, envelope: &Envelope, error: &str) -> Result<DeadLetterEntry> {
        let payload = serde_json::to_value(envelope).unwrap_or(Value::Null);
        let content = envelope.body.as_content();

        let input = NewDeadLetter {
            message_id: envelope.message_id.clone(),
            ship_id: Some(envelope.ship_id.clone()),
            content_type: envelope.body.content_ref().map(|(ct, _)| ct.clone()),
            content_id: envelope.body.content_ref().map(|(_, id)| id.clone()),
            operation: content.map(|(op, _)| op),
            payload,
            error_message: error.to_string(),
            max_retries: self.max_retries,
        };
        self.add(input).await
    }

    /// Record bytes that could not be decoded at all.
    ///
    /// Without an envelope there is no message id, so one is derived from
    /// the payload hash; redelivery of the same bytes lands on the same entry.
    pub async fn add_undecodable(&self, payload: &[u8], error: &str) -> Result<DeadLetterEntry> {
        let digest = blake3::hash(payload);
        let input = NewDeadLetter {
            message_id: MessageId::new(format!("undecodable-{}", digest.to_hex())),
            ship_id: None,
            content_type: None,
            content_id: None,
            operation: None,
            payload: Value::String(String::from_utf8_lossy(payload).into_owned()),
            error_message: error.to_string(),
            max_retries: self.max_retries,
        };
        self.add(input).await
    }

    pub async fn add(&self, input: NewDeadLetter) -> Result<DeadLetterEntry> {
        let entry = self.store.add_dead_letter(input, now_millis()).await?;
        tracing::error!(
            dead_letter_id = entry.id,
            message_id = %entry.message_id,
            error = %entry.error_message,
            "message dead-lettered"
        );
        Ok(entry)
    }

    /// Entries still eligible for a replay.
    pub async fn get_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.pending_dead_letters(limit).await?)
    }

    pub async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.list_dead_letters(status, limit).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        Ok(self.store.get_dead_letter(id).await?)
    }

    /// Count a retry attempt; the returned entry is `exhausted` once the
    /// budget is spent.
    pub async fn mark_retrying(&self, id: i64) -> Result<DeadLetterEntry> {
        let entry = self.store.mark_dead_letter_retrying(id, now_millis()).await?;
        if entry.status == DeadLetterStatus::Exhausted {
            tracing::warn!(
                dead_letter_id = id,
                retries = entry.retry_count,
                "dead letter exhausted its retries"
            );
        }
        Ok(entry)
    }

    pub async fn record_error(&self, id: i64, error: &str) -> Result<()> {
        Ok(self.store.record_dead_letter_error(id, error).await?)
    }

    pub async fn mark_resolved(&self, id: i64, resolved_by: &str) -> Result<DeadLetterEntry> {
        Ok(self
            .store
            .resolve_dead_letter(id, resolved_by, now_millis())
            .await?)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.store.delete_dead_letter(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipsync_core::{ContentChange, ContentType, DocumentId, MessageBody, Operation, ShipId};
    use shipsync_store::MemoryStore;

    fn update() -> Envelope {
        Envelope::new(
            ShipId::new("ship-1"),
            MessageBody::Update(ContentChange {
                content_type: ContentType::new("api::article.article"),
                content_id: DocumentId::new("r-1"),
                version: 2,
                data: Some(json!({"title": "x"})),
                metadata: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_add_envelope_captures_context() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryStore::new()), 3);
        let envelope = update();

        let entry = dlq.add_envelope(&envelope, "unknown content type").await.unwrap();
        assert_eq!(entry.message_id, envelope.message_id);
        assert_eq!(entry.operation, Some(Operation::Update));
        assert_eq!(entry.content_id.as_ref().map(|c| c.as_str()), Some("r-1"));
        assert_eq!(entry.max_retries, 3);

        let replayed: Envelope = serde_json::from_value(entry.payload).unwrap();
        assert_eq!(replayed, envelope);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_keyed_by_hash() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryStore::new()), 3);

        let a = dlq.add_undecodable(b"not json", "decode").await.unwrap();
        let b = dlq.add_undecodable(b"not json", "decode again").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.error_message, "decode again");
        assert!(a.message_id.as_str().starts_with("undecodable-"));
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryStore::new()), 2);
        let entry = dlq.add_envelope(&update(), "boom").await.unwrap();

        assert_eq!(dlq.mark_retrying(entry.id).await.unwrap().status, DeadLetterStatus::Retrying);
        assert_eq!(dlq.mark_retrying(entry.id).await.unwrap().status, DeadLetterStatus::Exhausted);
        assert!(dlq.get_pending(10).await.unwrap().is_empty());

        let resolved = dlq.mark_resolved(entry.id, "ops").await.unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops"));
        assert!(dlq.delete(entry.id).await.unwrap());
    }
}
