//! # ShipSync Testkit
//!
//! Testing utilities for ShipSync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a master and any number of ships wired over one in-memory
//!   broker, each with a hooked in-memory content store
//! - **Generators**: proptest strategies for document bodies and ship edit
//!   scripts
//!
//! The end-to-end scenarios live in `tests/`.
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use serde_json::json;
//! use shipsync::{ContentStore, ContentType, Origin};
//! use shipsync_testkit::Fleet;
//!
//! async fn example() -> shipsync::Result<()> {
//!     let fleet = Fleet::new(&["ship-1"])?;
//!     let ship = fleet.ship("ship-1").unwrap();
//!
//!     let article = ContentType::new("api::article.article");
//!     let doc = ship
//!         .content
//!         .create(&article, json!({"title": "Noon report"}), Origin::Local)
//!         .await?;
//!
//!     fleet.settle().await?;
//!     let copy = fleet.master_copy("ship-1", &article, &doc.id).await?;
//!     assert!(copy.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use shipsync_testkit::generators::edit_script;
//!
//! proptest! {
//!     #[test]
//!     fn scripts_are_bounded(script in edit_script(8)) {
//!         prop_assert!(script.len() <= 8);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_config, master_node, ship_node, Fleet, Node, MASTER_GROUP, PUMP_WAIT};
pub use generators::{edit_script, payload, ShipEdit, Slots};
