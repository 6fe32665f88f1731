//! Engine configuration.
//!
//! Every tunable has a default; [`EngineConfig::from_env`] overlays the
//! `SHIPSYNC_*` environment variables.

use std::time::Duration;

use shipsync_core::{NodeRole, ShipId, DEFAULT_MAX_RETRIES};
use shipsync_sync::{HeartbeatConfig, MonitorConfig, PushConfig, TransportConfig};

use crate::error::{EngineError, Result};

/// What a replica does when a master change arrives for a document that was
/// edited locally since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalConflictPolicy {
    /// Apply the master version and log the overwritten edit.
    #[default]
    MasterWins,
    /// Keep the local version and record a conflict for an operator.
    RecordConflict,
}

impl LocalConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalConflictPolicy::MasterWins => "master-wins",
            LocalConflictPolicy::RecordConflict => "record-conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master-wins" => Some(LocalConflictPolicy::MasterWins),
            "record-conflict" | "record" => Some(LocalConflictPolicy::RecordConflict),
            _ => None,
        }
    }
}

/// Configuration for a sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub role: NodeRole,
    /// This node's ship id. Ignored by the master, which always speaks as
    /// [`ShipId::master`].
    pub ship_id: ShipId,
    pub ship_name: Option<String>,

    pub transport: TransportConfig,
    pub push: PushConfig,
    pub monitor: MonitorConfig,
    pub heartbeat: HeartbeatConfig,

    /// Push attempts per outbox entry before it is marked `failed`.
    pub outbox_max_retries: u32,
    /// Replays per dead letter before it is `exhausted`.
    pub dead_letter_max_retries: u32,
    pub dead_letter_retry_interval: Duration,
    pub dead_letter_batch: usize,

    /// How long processed-message records and synced outbox entries are kept.
    pub processed_retention: Duration,
    pub maintenance_interval: Duration,

    /// How long the consumer waits for a message before re-checking shutdown.
    pub consumer_poll_interval: Duration,

    pub local_conflict_policy: LocalConflictPolicy,
    /// Content types with any of these prefixes are never synced.
    pub excluded_content_prefixes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Replica,
            ship_id: ShipId::new("ship"),
            ship_name: None,
            transport: TransportConfig::default(),
            push: PushConfig::default(),
            monitor: MonitorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            outbox_max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_retry_interval: Duration::from_secs(60),
            dead_letter_batch: 50,
            processed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            maintenance_interval: Duration::from_secs(60 * 60),
            consumer_poll_interval: Duration::from_millis(500),
            local_conflict_policy: LocalConflictPolicy::default(),
            excluded_content_prefixes: vec!["admin::".into(), "plugin::".into()],
        }
    }
}

impl EngineConfig {
    /// Defaults for the master node.
    pub fn master() -> Self {
        Self {
            role: NodeRole::Master,
            ship_id: ShipId::master(),
            ..Self::default()
        }
    }

    /// Defaults for a replica with the given ship id.
    pub fn replica(ship_id: impl Into<ShipId>) -> Self {
        Self {
            role: NodeRole::Replica,
            ship_id: ship_id.into(),
            ..Self::default()
        }
    }

    /// Load from `SHIPSYNC_*` environment variables.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `SHIPSYNC_MODE` | `master` or `replica` (required) |
    /// | `SHIPSYNC_SHIP_ID` | required for replicas |
    /// | `SHIPSYNC_SHIP_NAME` | display name sent with heartbeats |
    /// | `SHIPSYNC_DEBOUNCE_MS` | push debounce |
    /// | `SHIPSYNC_AUTO_PUSH_SECS` | auto-push interval |
    /// | `SHIPSYNC_PROBE_SECS` | connectivity probe interval |
    /// | `SHIPSYNC_HEARTBEAT_SECS` | heartbeat interval |
    /// | `SHIPSYNC_CONNECT_TIMEOUT_SECS` | producer connect timeout |
    /// | `SHIPSYNC_REQUEST_TIMEOUT_SECS` | producer request timeout |
    /// | `SHIPSYNC_DEAD_LETTER_RETRY_SECS` | dead-letter sweep interval |
    /// | `SHIPSYNC_LOCAL_CONFLICT_POLICY` | `master-wins` or `record-conflict` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mode = lookup("SHIPSYNC_MODE")
            .ok_or_else(|| EngineError::Config("SHIPSYNC_MODE is not set".into()))?;
        let role = NodeRole::parse(mode.trim()).ok_or_else(|| {
            EngineError::Config(format!(
                "SHIPSYNC_MODE must be master or replica, got {mode:?}"
            ))
        })?;

        let mut config = match role {
            NodeRole::Master => Self::master(),
            NodeRole::Replica => {
                let ship_id = lookup("SHIPSYNC_SHIP_ID")
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| {
                        EngineError::Config("SHIPSYNC_SHIP_ID is required for replicas".into())
                    })?;
                if ship_id.trim() == ShipId::MASTER {
                    return Err(EngineError::Config(format!(
                        "SHIPSYNC_SHIP_ID {:?} is reserved",
                        ShipId::MASTER
                    )));
                }
                Self::replica(ship_id.trim())
            }
        };

        config.ship_name = lookup("SHIPSYNC_SHIP_NAME");

        if let Some(ms) = parse_u64(&lookup, "SHIPSYNC_DEBOUNCE_MS")? {
            config.push.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_AUTO_PUSH_SECS")? {
            config.push.auto_push_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_PROBE_SECS")? {
            config.monitor.probe_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_HEARTBEAT_SECS")? {
            config.heartbeat.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_CONNECT_TIMEOUT_SECS")? {
            config.transport.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_REQUEST_TIMEOUT_SECS")? {
            config.transport.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPSYNC_DEAD_LETTER_RETRY_SECS")? {
            config.dead_letter_retry_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = lookup("SHIPSYNC_LOCAL_CONFLICT_POLICY") {
            config.local_conflict_policy =
                LocalConflictPolicy::parse(policy.trim()).ok_or_else(|| {
                    EngineError::Config(format!(
                        "unknown SHIPSYNC_LOCAL_CONFLICT_POLICY {policy:?}"
                    ))
                })?;
        }

        Ok(config)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{key} must be an integer, got {raw:?}"))),
    }
}
