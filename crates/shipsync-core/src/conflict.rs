//! Conflict records and resolution strategies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{ContentType, DocumentId, ShipId, Timestamp};

/// Why a conflict was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// The master document changed after the ship's last confirmed sync.
    ConcurrentEdit,
    /// A master push found unsynced local edits on a replica.
    LocalEdit,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentEdit => "concurrent-edit",
            ConflictType::LocalEdit => "local-edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "concurrent-edit" => Some(ConflictType::ConcurrentEdit),
            "local-edit" => Some(ConflictType::LocalEdit),
            _ => None,
        }
    }
}

/// Operator decision applied to a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    KeepShip,
    KeepMaster,
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepShip => "keep-ship",
            ResolutionStrategy::KeepMaster => "keep-master",
            ResolutionStrategy::Merge => "merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep-ship" => Some(ResolutionStrategy::KeepShip),
            "keep-master" => Some(ResolutionStrategy::KeepMaster),
            "merge" => Some(ResolutionStrategy::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected conflict awaiting (or having received) an operator decision.
///
/// At most one unresolved record exists per `(content_type, content_id, ship_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLog {
    pub id: i64,
    pub content_type: ContentType,
    /// Master-side document id.
    pub content_id: DocumentId,
    pub ship_id: ShipId,
    pub ship_data: Value,
    pub master_data: Value,
    pub conflict_type: ConflictType,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolution_data: Option<Value>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
    pub created_at: Timestamp,
}

impl ConflictLog {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Input for recording a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub content_type: ContentType,
    pub content_id: DocumentId,
    pub ship_id: ShipId,
    pub ship_data: Value,
    pub master_data: Value,
    pub conflict_type: ConflictType,
}

/// A resolution to persist against a conflict row.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub data: Option<Value>,
    pub resolved_by: String,
}
