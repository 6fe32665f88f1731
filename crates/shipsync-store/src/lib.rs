//! # shipsync Store
//!
//! Persistence for everything the sync engine must not forget: the replica
//! outbox, document mappings, processed message ids, conflicts, dead letters,
//! the master's outbound buffer and the ship registry.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shipsync_core::{ContentType, DocumentId, NewQueueEntry, Operation, ShipId};
//! use shipsync_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("shipsync.db").unwrap();
//!
//!     let entry = store
//!         .enqueue(NewQueueEntry {
//!             ship_id: ShipId::new("ship-1"),
//!             content_type: ContentType::new("api::article.article"),
//!             content_id: DocumentId::new("doc-1"),
//!             operation: Operation::Delete,
//!             local_version: 0,
//!             payload: None,
//!         })
//!         .await
//!         .unwrap();
//!     store.mark_synced(entry.id).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Durable outbox**: queue entries survive restarts; in-flight entries
//!   are requeued on startup
//! - **Single-statement upserts**: concurrent writers cannot create
//!   duplicate mappings or open conflicts
//! - **Resolve once**: a conflict resolution is a conditional update

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::Store;
