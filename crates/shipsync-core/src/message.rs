//! Wire messages exchanged on the `ship-updates` and `master-updates` channels.
//!
//! Every message is a JSON envelope
//! `{messageId, shipId, timestamp, operation, ...}` where `operation`
//! selects the shape of the rest of the object:
//!
//! | operation | body |
//! |---|---|
//! | `create` / `update` / `delete` | [`ContentChange`] |
//! | `heartbeat` | [`Heartbeat`] |
//! | `mapping-ack` / `create-ack` | [`MappingAck`] |
//! | `conflict-rejected` | [`ConflictNotice`] |
//! | `conflict-resolved` | [`ResolutionNotice`] |

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::ResolutionStrategy;
use crate::error::{CoreError, Result};
use crate::types::{now_millis, ContentType, DocumentId, MessageId, Operation, ShipId, Timestamp};

/// Top-level message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: MessageId,
    /// Sender for ship-originated messages, target ship for master replies,
    /// [`ShipId::MASTER`] for master broadcasts.
    pub ship_id: ShipId,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Message payload, keyed by the `operation` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum MessageBody {
    Create(ContentChange),
    Update(ContentChange),
    Delete(ContentChange),
    Heartbeat(Heartbeat),
    MappingAck(MappingAck),
    CreateAck(MappingAck),
    ConflictRejected(ConflictNotice),
    ConflictResolved(ResolutionNotice),
}

/// A content mutation travelling between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChange {
    pub content_type: ContentType,
    /// Document id in the sender's id space.
    pub content_id: DocumentId,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChangeMetadata>,
}

/// Bookkeeping that lets the master echo the originating outbox entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_entry_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingAck {
    pub content_type: ContentType,
    pub replica_document_id: DocumentId,
    pub master_document_id: DocumentId,
    /// Master document version the replica now holds; advances the
    /// master's conflict watermark for the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
}

/// Sent to a ship when its update was rejected because of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotice {
    pub conflict_id: i64,
    pub content_type: ContentType,
    /// Master-side id.
    pub content_id: DocumentId,
    pub replica_document_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_entry_id: Option<i64>,
    pub reason: String,
    pub master_data: Value,
    pub ship_data: Value,
}

/// Sent to a ship once an operator resolved one of its conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionNotice {
    pub conflict_id: i64,
    pub content_type: ContentType,
    pub content_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_document_id: Option<DocumentId>,
    pub resolution: ResolutionStrategy,
    pub master_data: Value,
    pub ship_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
}

impl Envelope {
    /// Wrap a body with a fresh message id and the current time.
    pub fn new(ship_id: ShipId, body: MessageBody) -> Self {
        Self {
            message_id: MessageId::random(),
            ship_id,
            timestamp: now_millis(),
            body,
        }
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CoreError::Encoding(e.to_string()))
    }

    /// Parse JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Decoding(e.to_string()))
    }

    /// The wire `operation` string.
    pub fn operation(&self) -> &'static str {
        self.body.operation()
    }

    /// Check per-variant invariants that the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.as_str().is_empty() {
            return Err(CoreError::InvalidMessage("empty messageId".into()));
        }
        if self.ship_id.as_str().is_empty() {
            return Err(CoreError::InvalidMessage("empty shipId".into()));
        }
        match &self.body {
            MessageBody::Create(change) | MessageBody::Update(change) => {
                change.validate_ids()?;
                match &change.data {
                    Some(Value::Object(_)) => Ok(()),
                    _ => Err(CoreError::InvalidMessage(format!(
                        "{} for {}/{} carries no object data",
                        self.operation(),
                        change.content_type,
                        change.content_id
                    ))),
                }
            }
            MessageBody::Delete(change) => change.validate_ids(),
            MessageBody::MappingAck(ack) | MessageBody::CreateAck(ack) => {
                if ack.replica_document_id.as_str().is_empty()
                    || ack.master_document_id.as_str().is_empty()
                {
                    return Err(CoreError::InvalidMessage("ack without document ids".into()));
                }
                Ok(())
            }
            MessageBody::Heartbeat(_)
            | MessageBody::ConflictRejected(_)
            | MessageBody::ConflictResolved(_) => Ok(()),
        }
    }
}

impl ContentChange {
    fn validate_ids(&self) -> Result<()> {
        if self.content_type.as_str().is_empty() || self.content_id.as_str().is_empty() {
            return Err(CoreError::InvalidMessage(
                "content change without contentType/contentId".into(),
            ));
        }
        Ok(())
    }

    /// Outbox entry id echoed through conflict notices.
    pub fn queue_entry_id(&self) -> Option<i64> {
        self.metadata.as_ref().and_then(|m| m.queue_entry_id)
    }
}

impl MessageBody {
    /// Build a content-change body for an operation.
    pub fn content(operation: Operation, change: ContentChange) -> Self {
        match operation {
            Operation::Create => MessageBody::Create(change),
            Operation::Update => MessageBody::Update(change),
            Operation::Delete => MessageBody::Delete(change),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            MessageBody::Create(_) => "create",
            MessageBody::Update(_) => "update",
            MessageBody::Delete(_) => "delete",
            MessageBody::Heartbeat(_) => "heartbeat",
            MessageBody::MappingAck(_) => "mapping-ack",
            MessageBody::CreateAck(_) => "create-ack",
            MessageBody::ConflictRejected(_) => "conflict-rejected",
            MessageBody::ConflictResolved(_) => "conflict-resolved",
        }
    }

    /// The content operation and change, if this is a content message.
    pub fn as_content(&self) -> Option<(Operation, &ContentChange)> {
        match self {
            MessageBody::Create(c) => Some((Operation::Create, c)),
            MessageBody::Update(c) => Some((Operation::Update, c)),
            MessageBody::Delete(c) => Some((Operation::Delete, c)),
            _ => None,
        }
    }

    /// Whether the message is addressed to one specific ship.
    pub fn is_targeted(&self) -> bool {
        matches!(
            self,
            MessageBody::MappingAck(_)
                | MessageBody::CreateAck(_)
                | MessageBody::ConflictRejected(_)
                | MessageBody::ConflictResolved(_)
        )
    }

    /// `(content_type, content_id)` referenced by the message, for diagnostics.
    pub fn content_ref(&self) -> Option<(&ContentType, &DocumentId)> {
        match self {
            MessageBody::Create(c) | MessageBody::Update(c) | MessageBody::Delete(c) => {
                Some((&c.content_type, &c.content_id))
            }
            MessageBody::MappingAck(a) | MessageBody::CreateAck(a) => {
                Some((&a.content_type, &a.replica_document_id))
            }
            MessageBody::ConflictRejected(n) => Some((&n.content_type, &n.content_id)),
            MessageBody::ConflictResolved(n) => Some((&n.content_type, &n.content_id)),
            MessageBody::Heartbeat(_) => None,
        }
    }
}
