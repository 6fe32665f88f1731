//! Idempotency gate for inbound messages.

use std::sync::Arc;
use std::time::Duration;

use shipsync_core::{now_millis, MessageId, ProcessedStatus};
use shipsync_store::Store;

use crate::error::Result;

/// Records which message ids were already handled.
///
/// Both successfully applied and failed messages are recorded: a failed
/// message belongs to the dead-letter path and must not be reapplied when
/// the broker redelivers it.
pub struct MessageTracker<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for MessageTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> MessageTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn is_processed(&self, message_id: &MessageId) -> Result<bool> {
        Ok(self.store.get_processed(message_id).await?.is_some())
    }

    /// Returns false if the id was already recorded.
    pub async fn mark_processed(&self, message_id: &MessageId) -> Result<bool> {
        let inserted = self
            .store
            .record_processed(message_id, ProcessedStatus::Processed, now_millis())
            .await?;
        Ok(inserted)
    }

    /// Record a message whose processing failed.
    pub async fn mark_failed(&self, message_id: &MessageId) -> Result<()> {
        let inserted = self
            .store
            .record_processed(message_id, ProcessedStatus::Failed, now_millis())
            .await?;
        if !inserted {
            self.store
                .update_processed(message_id, ProcessedStatus::Failed)
                .await?;
        }
        Ok(())
    }

    /// Flip a failed record to processed after a successful replay.
    pub async fn mark_recovered(&self, message_id: &MessageId) -> Result<()> {
        if !self.mark_processed(message_id).await? {
            self.store
                .update_processed(message_id, ProcessedStatus::Processed)
                .await?;
        }
        Ok(())
    }

    /// Delete records older than `retention`.
    pub async fn prune(&self, retention: Duration) -> Result<usize> {
        let cutoff = now_millis() - retention.as_millis() as i64;
        let pruned = self.store.prune_processed(cutoff).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned processed message records");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipsync_store::MemoryStore;

    #[tokio::test]
    async fn test_gate() {
        let tracker = MessageTracker::new(Arc::new(MemoryStore::new()));
        let id = MessageId::new("abc");

        assert!(!tracker.is_processed(&id).await.unwrap());
        assert!(tracker.mark_processed(&id).await.unwrap());
        assert!(tracker.is_processed(&id).await.unwrap());
        assert!(!tracker.mark_processed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_then_recovered() {
        let store = Arc::new(MemoryStore::new());
        let tracker = MessageTracker::new(store.clone());
        let id = MessageId::new("abc");

        tracker.mark_failed(&id).await.unwrap();
        assert!(tracker.is_processed(&id).await.unwrap());
        assert_eq!(
            store.get_processed(&id).await.unwrap().unwrap().status,
            ProcessedStatus::Failed
        );

        tracker.mark_recovered(&id).await.unwrap();
        assert_eq!(
            store.get_processed(&id).await.unwrap().unwrap().status,
            ProcessedStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_recent() {
        let tracker = MessageTracker::new(Arc::new(MemoryStore::new()));
        let id = MessageId::new("recent");
        tracker.mark_processed(&id).await.unwrap();

        assert_eq!(tracker.prune(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(tracker.is_processed(&id).await.unwrap());
    }
}
