//! Document identity mapping between a replica's and the master's id spaces.

use serde::{Deserialize, Serialize};

use crate::types::{ContentType, DocumentId, ShipId, Timestamp};

/// Which side performed the last successful sync of a mapped document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncedBy {
    Ship,
    Master,
}

impl SyncedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncedBy::Ship => "ship",
            SyncedBy::Master => "master",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ship" => Some(SyncedBy::Ship),
            "master" => Some(SyncedBy::Master),
            _ => None,
        }
    }
}

/// One row of the (replica id <-> master id) table.
///
/// Unique per `(ship_id, content_type, replica_document_id)` and per
/// `(ship_id, content_type, master_document_id)`. `updated_at` is the
/// watermark: the last instant replica and master were known consistent
/// for this document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMapping {
    pub ship_id: ShipId,
    pub content_type: ContentType,
    pub replica_document_id: DocumentId,
    pub master_document_id: DocumentId,
    pub last_synced_by: SyncedBy,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DocumentMapping {
    /// The watermark used by conflict detection.
    pub fn watermark(&self) -> Timestamp {
        self.updated_at
    }
}
