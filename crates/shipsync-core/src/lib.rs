//! # shipsync Core
//!
//! Pure primitives for shipsync: identifiers, the records persisted by the
//! sync engine, the wire envelope, and payload sanitization.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Envelope`] / [`MessageBody`] - The tagged wire message
//! - [`SyncQueueEntry`] - A replica mutation awaiting transmission
//! - [`DocumentMapping`] - Replica id <-> master id, with the conflict watermark
//! - [`ConflictLog`] - A detected conflict and its eventual resolution
//! - [`DeadLetterEntry`] - An inbound message that failed processing

pub mod conflict;
pub mod dead_letter;
pub mod error;
pub mod mapping;
pub mod message;
pub mod outbox;
pub mod registry;
pub mod sanitize;
pub mod types;

pub use conflict::{ConflictLog, ConflictResolution, ConflictType, NewConflict, ResolutionStrategy};
pub use dead_letter::{DeadLetterEntry, DeadLetterStatus, NewDeadLetter, DEFAULT_MAX_RETRIES};
pub use error::{CoreError, Result};
pub use mapping::{DocumentMapping, SyncedBy};
pub use message::{
    ChangeMetadata, ConflictNotice, ContentChange, Envelope, Heartbeat, MappingAck, MessageBody,
    ResolutionNotice,
};
pub use outbox::{NewQueueEntry, OutboundEntry, OutboundStatus, QueueStatus, SyncQueueEntry};
pub use registry::{ConnectivityStatus, ProcessedMessage, ProcessedStatus, ShipRecord};
pub use sanitize::{is_sensitive_key, sanitize};
pub use types::{
    now_millis, ContentType, DocumentId, MessageId, NodeRole, Operation, ShipId, Timestamp,
};
