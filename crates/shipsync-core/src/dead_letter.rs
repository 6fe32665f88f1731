//! Dead letter records for inbound messages whose processing failed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ContentType, DocumentId, MessageId, Operation, ShipId, Timestamp};

/// Default number of replays before an entry is exhausted.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Exhausted,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Exhausted => "exhausted",
            DeadLetterStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeadLetterStatus::Pending),
            "retrying" => Some(DeadLetterStatus::Retrying),
            "exhausted" => Some(DeadLetterStatus::Exhausted),
            "resolved" => Some(DeadLetterStatus::Resolved),
            _ => None,
        }
    }

    /// Eligible for the retry sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeadLetterStatus::Pending | DeadLetterStatus::Retrying)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub message_id: MessageId,
    pub ship_id: Option<ShipId>,
    pub content_type: Option<ContentType>,
    pub content_id: Option<DocumentId>,
    pub operation: Option<Operation>,
    /// The original message, or the raw text when it could not be decoded.
    pub payload: Value,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: DeadLetterStatus,
    pub created_at: Timestamp,
    pub last_retry_at: Option<Timestamp>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub message_id: MessageId,
    pub ship_id: Option<ShipId>,
    pub content_type: Option<ContentType>,
    pub content_id: Option<DocumentId>,
    pub operation: Option<Operation>,
    pub payload: Value,
    pub error_message: String,
    pub max_retries: u32,
}
