//! # ShipSync
//!
//! Offline-first content sync between a shore-side master and the ships
//! that carry replicas of its content.
//!
//! ## Overview
//!
//! Each node runs the same engine in one of two roles:
//!
//! - **Replica** (a ship): local edits land in a durable outbox and are
//!   pushed to the master in order whenever the broker is reachable. Master
//!   changes are applied locally and acknowledged.
//! - **Master** (shore): ship edits are applied unless the master document
//!   moved since that ship last synced it, in which case a conflict is
//!   recorded for an operator. Master edits are broadcast to every ship.
//!
//! ## Key Concepts
//!
//! - **Mapping**: pairs a ship's document id with the master's id. Its
//!   timestamp is the watermark used for conflict detection.
//! - **Origin**: every write says who made it. Only local writes are synced,
//!   so applied changes never echo back.
//! - **Dead letter**: a message that failed processing, kept for retry and
//!   manual triage.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shipsync::{ContentStore, EngineConfig, SyncEngine};
//! use shipsync::store::SqliteStore;
//! use shipsync::sync::MemoryBroker;
//!
//! async fn example<C: ContentStore + 'static>(content: Arc<C>) -> shipsync::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let store = Arc::new(SqliteStore::open("shipsync.db")?);
//!     let broker = MemoryBroker::new();
//!
//!     let engine = Arc::new(SyncEngine::new(
//!         config,
//!         store,
//!         content,
//!         broker.create_transport("ship-1-producer"),
//!         broker.create_transport("ship-1"),
//!     )?);
//!
//!     // Register `engine` as the host's `MutationHook` so content writes
//!     // reach the outbox.
//!
//!     engine.start().await?;
//!     // ...
//!     engine.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `shipsync::core` - ids, messages and records
//! - `shipsync::store` - the persistence trait, SQLite and in-memory stores
//! - `shipsync::sync` - transport, dispatcher, push worker and monitors

pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod hook;
mod lifecycle;
pub mod master;
pub mod replica;

pub use shipsync_core as core;
pub use shipsync_store as store;
pub use shipsync_sync as sync;

pub use config::{EngineConfig, LocalConflictPolicy};
pub use content::{ContentStore, Document, Mutation, MutationAction, MutationHook, Origin};
pub use engine::SyncEngine;
pub use error::{EngineError, Result};
pub use hook::{MutationFilter, TrackedChange};
pub use lifecycle::{run_maintenance, MaintenanceReport, SyncStatus};
pub use master::{MasterEngine, MasterNode, SendOutcome};
pub use replica::{ReplicaEngine, ReplicaNode};

pub use shipsync_core::{
    ConflictLog, ContentType, DocumentId, NodeRole, Operation, ResolutionStrategy, ShipId,
};
