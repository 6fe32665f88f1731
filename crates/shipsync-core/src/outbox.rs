//! Outbox records: the replica's sync queue and the master's outbound buffer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ContentType, DocumentId, Operation, ShipId, Timestamp};

/// Lifecycle of a sync queue entry.
///
/// ```text
/// pending -> syncing -> synced
///                    -> pending (retry) -> ... -> failed
///                    -> conflict_pending -> conflict_rejected
///                                        -> conflict_accepted
///                                        -> conflict_merged
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    ConflictPending,
    ConflictRejected,
    ConflictAccepted,
    ConflictMerged,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
            QueueStatus::ConflictPending => "conflict_pending",
            QueueStatus::ConflictRejected => "conflict_rejected",
            QueueStatus::ConflictAccepted => "conflict_accepted",
            QueueStatus::ConflictMerged => "conflict_merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "syncing" => Some(QueueStatus::Syncing),
            "synced" => Some(QueueStatus::Synced),
            "failed" => Some(QueueStatus::Failed),
            "conflict_pending" => Some(QueueStatus::ConflictPending),
            "conflict_rejected" => Some(QueueStatus::ConflictRejected),
            "conflict_accepted" => Some(QueueStatus::ConflictAccepted),
            "conflict_merged" => Some(QueueStatus::ConflictMerged),
            _ => None,
        }
    }

    /// No further transition is expected from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Synced
                | QueueStatus::Failed
                | QueueStatus::ConflictRejected
                | QueueStatus::ConflictAccepted
                | QueueStatus::ConflictMerged
        )
    }
}

/// A local mutation awaiting transmission to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub ship_id: ShipId,
    pub content_type: ContentType,
    pub content_id: DocumentId,
    pub operation: Operation,
    pub local_version: i64,
    pub payload: Option<Value>,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub conflict_id: Option<i64>,
    pub created_at: Timestamp,
    pub synced_at: Option<Timestamp>,
}

/// Input to [`SyncQueueEntry`] creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub ship_id: ShipId,
    pub content_type: ContentType,
    pub content_id: DocumentId,
    pub operation: Operation,
    pub local_version: i64,
    pub payload: Option<Value>,
}

/// Status of a buffered master-side message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboundStatus::Pending),
            "sent" => Some(OutboundStatus::Sent),
            "failed" => Some(OutboundStatus::Failed),
            _ => None,
        }
    }
}

/// A master-authored message buffered while the transport is unreachable.
///
/// The envelope is kept already encoded so a flush replays exactly what
/// would have been sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEntry {
    pub id: i64,
    pub topic: String,
    pub key: String,
    pub message: Value,
    pub status: OutboundStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_roundtrip_strings() {
        let all = [
            QueueStatus::Pending,
            QueueStatus::Syncing,
            QueueStatus::Synced,
            QueueStatus::Failed,
            QueueStatus::ConflictPending,
            QueueStatus::ConflictRejected,
            QueueStatus::ConflictAccepted,
            QueueStatus::ConflictMerged,
        ];
        for status in all {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_conflict_pending_is_not_terminal() {
        assert!(!QueueStatus::ConflictPending.is_terminal());
        assert!(!QueueStatus::Syncing.is_terminal());
        assert!(QueueStatus::ConflictMerged.is_terminal());
    }
}
