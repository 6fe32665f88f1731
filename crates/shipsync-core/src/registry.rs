//! Ship liveness records kept by the master.

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, ShipId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Online => "online",
            ConnectivityStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(ConnectivityStatus::Online),
            "offline" => Some(ConnectivityStatus::Offline),
            _ => None,
        }
    }
}

/// Observational liveness of one ship. Never gates sync acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipRecord {
    pub ship_id: ShipId,
    pub ship_name: String,
    pub connectivity_status: ConnectivityStatus,
    pub last_seen_at: Timestamp,
}

/// Outcome recorded for a processed inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedStatus {
    Processed,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Processed => "processed",
            ProcessedStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processed" => Some(ProcessedStatus::Processed),
            "failed" => Some(ProcessedStatus::Failed),
            _ => None,
        }
    }
}

/// Write-once idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: MessageId,
    pub status: ProcessedStatus,
    pub processed_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_status_strings() {
        assert_eq!(ConnectivityStatus::parse("online"), Some(ConnectivityStatus::Online));
        assert_eq!(ConnectivityStatus::Offline.as_str(), "offline");
        assert_eq!(ProcessedStatus::parse("failed"), Some(ProcessedStatus::Failed));
    }

    #[test]
    fn test_ship_record_serializes() {
        let record = ShipRecord {
            ship_id: ShipId::new("ship-1"),
            ship_name: "Aurora".into(),
            connectivity_status: ConnectivityStatus::Online,
            last_seen_at: 10,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["connectivity_status"], "online");
    }
}
