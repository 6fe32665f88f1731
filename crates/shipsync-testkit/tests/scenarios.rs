//! End-to-end sync between a master and its ships over the in-memory broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use shipsync::content::memory::MemoryContentStore;
use shipsync::{ContentStore, Document, EngineConfig, EngineError, Origin};
use shipsync_core::{
    ContentType, DeadLetterStatus, NodeRole, Operation, QueueStatus, ResolutionStrategy, ShipId,
};
use shipsync_store::{SqliteStore, Store, StoreError};
use shipsync_sync::{MemoryBroker, Topic};
use shipsync_testkit::fixtures::ShipEngine;
use shipsync_testkit::{fast_config, master_node, ship_node, Fleet, Node, MASTER_GROUP, PUMP_WAIT};

fn article() -> ContentType {
    ContentType::new("api::article.article")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ship1(fleet: &Fleet) -> &Node<ShipEngine> {
    fleet.ship("ship-1").unwrap()
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Ship-1 creates a document while the broker is down, then reconnects.
async fn offline_create(fleet: &Fleet) -> Document {
    let ship = ship1(fleet);
    fleet.broker.set_reachable(false);

    let doc = ship
        .content
        .create(
            &article(),
            json!({"title": "Noon report", "password": "hunter2"}),
            Origin::Local,
        )
        .await
        .unwrap();

    let pending = ship.engine.queue(Some(QueueStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Create);
    assert_eq!(ship.engine.push_now().await.unwrap(), 0);

    fleet.broker.set_reachable(true);
    fleet.settle().await.unwrap();
    doc
}

/// Master and ship-1 edit the same document; ship-1 pushes without having
/// seen the master edit.
async fn concurrent_edit(fleet: &Fleet, doc: &Document) -> i64 {
    let ship = ship1(fleet);
    let master_id = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap()
        .id;

    ship.content
        .update(&article(), &doc.id, json!({"title": "ship edit"}), Origin::Local)
        .await
        .unwrap();
    fleet
        .master
        .content
        .update(&article(), &master_id, json!({"title": "master edit"}), Origin::Local)
        .await
        .unwrap();

    fleet.settle().await.unwrap();
    let conflicts = fleet.master.engine.conflicts(true).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    conflicts[0].id
}

#[tokio::test]
async fn test_offline_create_is_mapped_after_reconnect() {
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let doc = offline_create(&fleet).await;
    let ship = ship1(&fleet);

    let mapping = ship
        .engine
        .store()
        .get_mapping(ship.engine.ship_id(), &article(), &doc.id)
        .await
        .unwrap()
        .expect("replica mapping");
    let copy = fleet
        .master
        .content
        .get(&article(), &mapping.master_document_id)
        .await
        .unwrap();
    assert_eq!(copy.data, json!({"title": "Noon report"}));
    assert!(copy.published);

    let synced = ship.engine.queue(Some(QueueStatus::Synced)).await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(ship.engine.status().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn test_concurrent_edit_is_held_as_conflict() {
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let doc = offline_create(&fleet).await;
    let conflict_id = concurrent_edit(&fleet, &doc).await;

    let log = fleet.master.engine.conflict(conflict_id).await.unwrap().unwrap();
    assert_eq!(log.ship_id, ShipId::new("ship-1"));
    assert_eq!(log.ship_data, json!({"title": "ship edit"}));
    assert_eq!(log.master_data, json!({"title": "master edit"}));

    let copy = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.data, json!({"title": "master edit"}));

    let held = ship1(&fleet)
        .engine
        .queue(Some(QueueStatus::ConflictPending))
        .await
        .unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].operation, Operation::Update);
    assert_eq!(held[0].conflict_id, Some(conflict_id));
}

#[tokio::test]
async fn test_keep_ship_resolution_reaches_both_sides() {
    init_tracing();
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let doc = offline_create(&fleet).await;
    let conflict_id = concurrent_edit(&fleet, &doc).await;
    let ship_id = ShipId::new("ship-1");

    let watermark = |fleet: &Fleet| {
        let ship_id = ship_id.clone();
        let store = Arc::clone(fleet.master.engine.store());
        let doc_id = doc.id.clone();
        async move {
            store
                .get_mapping(&ship_id, &article(), &doc_id)
                .await
                .unwrap()
                .unwrap()
                .watermark()
        }
    };
    let before = watermark(&fleet).await;

    fleet
        .master
        .engine
        .resolve_conflict(conflict_id, ResolutionStrategy::KeepShip, None, "operator")
        .await
        .unwrap();
    fleet.settle().await.unwrap();

    let copy = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.data, json!({"title": "ship edit"}));
    assert!(watermark(&fleet).await > before);

    let ship = ship1(&fleet);
    let accepted = ship
        .engine
        .queue(Some(QueueStatus::ConflictAccepted))
        .await
        .unwrap();
    assert_eq!(accepted.len(), 1);
    let local = ship.content.get(&article(), &doc.id).await.unwrap();
    assert_eq!(local.data, json!({"title": "ship edit"}));

    // A second resolution is refused and sends nothing.
    let err = fleet
        .master
        .engine
        .resolve_conflict(conflict_id, ResolutionStrategy::KeepMaster, None, "operator")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::AlreadyResolved(_))));
    assert_eq!(fleet.settle().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failing_apply_exhausts_dead_letter() {
    init_tracing();
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let ship = ship1(&fleet);
    let master = &fleet.master;
    master.content.reject_writes(true);

    ship.content
        .create(&article(), json!({"title": "rejected"}), Origin::Local)
        .await
        .unwrap();
    fleet.settle().await.unwrap();

    let r1 = master.engine.retry_dead_letters().await.unwrap();
    let r2 = master.engine.retry_dead_letters().await.unwrap();
    let r3 = master.engine.retry_dead_letters().await.unwrap();
    assert_eq!((r1.failed, r2.failed, r3.exhausted), (1, 1, 1));

    let entries = master.engine.dead_letters().list(None, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DeadLetterStatus::Exhausted);
    assert_eq!(entries[0].ship_id, Some(ShipId::new("ship-1")));

    // Redelivery is dropped even once writes would succeed.
    master.content.reject_writes(false);
    fleet.broker.rewind(MASTER_GROUP, Topic::ShipUpdates).await;
    assert_eq!(master.engine.pump(PUMP_WAIT).await.unwrap(), 1);
    assert!(master.content.is_empty().await);
}

#[tokio::test]
async fn test_redelivered_messages_apply_once() {
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let doc = offline_create(&fleet).await;
    let ship = ship1(&fleet);

    fleet.broker.rewind(MASTER_GROUP, Topic::ShipUpdates).await;
    fleet.broker.rewind("ship-1", Topic::MasterUpdates).await;
    assert!(fleet.master.engine.pump(PUMP_WAIT).await.unwrap() > 0);
    assert!(ship.engine.pump(PUMP_WAIT).await.unwrap() > 0);

    assert_eq!(fleet.master.content.len().await, 1);
    assert_eq!(ship.content.len().await, 1);
    assert!(fleet.master.engine.conflicts(false).await.unwrap().is_empty());
    assert!(fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_master_edits_do_not_echo() {
    let fleet = Fleet::new(&["ship-1", "ship-2"]).unwrap();
    let doc = offline_create(&fleet).await;
    let master_id = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap()
        .id;

    fleet
        .master
        .content
        .update(&article(), &master_id, json!({"title": "from shore"}), Origin::Local)
        .await
        .unwrap();
    fleet.settle().await.unwrap();

    let ship1 = ship1(&fleet);
    let ship2 = fleet.ship("ship-2").unwrap();
    let local = ship1.content.get(&article(), &doc.id).await.unwrap();
    assert_eq!(local.data, json!({"title": "from shore"}));
    assert_eq!(ship1.engine.queue(None).await.unwrap().len(), 1);

    let copies = ship2.content.list(&article()).await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].data, json!({"title": "from shore"}));
    assert!(ship2.engine.queue(None).await.unwrap().is_empty());

    assert_eq!(fleet.settle().await.unwrap(), 0);
    assert_eq!(fleet.master.content.len().await, 1);
    assert!(fleet.master.engine.conflicts(false).await.unwrap().is_empty());
}

/// Every document's data on a node, sorted for comparison across nodes.
async fn contents(content: &MemoryContentStore) -> Vec<String> {
    let mut out: Vec<String> = content
        .list(&article())
        .await
        .into_iter()
        .map(|d| d.data.to_string())
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn test_pull_before_push_converges_on_master_edit() {
    init_tracing();
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let ship = ship1(&fleet);
    let doc = ship
        .content
        .create(&article(), json!({"title": "draft"}), Origin::Local)
        .await
        .unwrap();
    fleet.settle().await.unwrap();
    let master_id = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap()
        .id;

    ship.content
        .update(&article(), &doc.id, json!({"title": "ship edit"}), Origin::Local)
        .await
        .unwrap();
    fleet
        .master
        .content
        .update(&article(), &master_id, json!({"title": "master edit"}), Origin::Local)
        .await
        .unwrap();

    // The ship sees the master edit before its own edit is pushed.
    ship.engine.pump(PUMP_WAIT).await.unwrap();
    fleet.settle().await.unwrap();

    assert!(fleet.master.engine.conflicts(true).await.unwrap().is_empty());
    assert_eq!(ship.engine.status().await.unwrap().pending_count, 0);
    assert_eq!(contents(&ship.content).await, vec![r#"{"title":"master edit"}"#]);
    assert_eq!(contents(&fleet.master.content).await, contents(&ship.content).await);

    // Later ship edits still apply cleanly on the master.
    ship.content
        .update(&article(), &doc.id, json!({"title": "after"}), Origin::Local)
        .await
        .unwrap();
    fleet.settle().await.unwrap();
    assert!(fleet.master.engine.conflicts(true).await.unwrap().is_empty());
    assert_eq!(contents(&fleet.master.content).await, vec![r#"{"title":"after"}"#]);
    assert_eq!(contents(&ship.content).await, contents(&fleet.master.content).await);
}

#[tokio::test]
async fn test_create_ack_precedes_master_edit_on_every_ship() {
    init_tracing();
    let fleet = Fleet::new(&["ship-1", "ship-2"]).unwrap();
    for (i, ship) in fleet.ships.iter().enumerate() {
        ship.content
            .create(&article(), json!({"title": format!("report {i}")}), Origin::Local)
            .await
            .unwrap();
        assert_eq!(ship.engine.push_now().await.unwrap(), 1);
    }
    fleet.master.engine.pump(PUMP_WAIT).await.unwrap();
    assert_eq!(fleet.master.content.len().await, 2);

    // Edit both before any ship has read its create-ack.
    for doc in fleet.master.content.list(&article()).await {
        let title = doc.data["title"].as_str().unwrap().replace("report", "edited");
        fleet
            .master
            .content
            .update(&article(), &doc.id, json!({"title": title}), Origin::Local)
            .await
            .unwrap();
    }
    for ship in &fleet.ships {
        ship.engine.pump(PUMP_WAIT).await.unwrap();
    }
    fleet.settle().await.unwrap();

    let expected = vec![
        r#"{"title":"edited 0"}"#.to_string(),
        r#"{"title":"edited 1"}"#.to_string(),
    ];
    assert_eq!(contents(&fleet.master.content).await, expected);
    for ship in &fleet.ships {
        assert_eq!(contents(&ship.content).await, expected);
        assert_eq!(ship.engine.status().await.unwrap().pending_count, 0);
    }
    assert!(fleet.master.engine.conflicts(true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_master_broadcast_buffered_until_reconnect() {
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let doc = offline_create(&fleet).await;
    let master_id = fleet
        .master_copy("ship-1", &article(), &doc.id)
        .await
        .unwrap()
        .unwrap()
        .id;

    fleet.broker.set_reachable(false);
    fleet
        .master
        .content
        .update(&article(), &master_id, json!({"title": "storm warning"}), Origin::Local)
        .await
        .unwrap();
    let status = fleet.master.engine.status().await.unwrap();
    assert_eq!(status.mode, NodeRole::Master);
    assert_eq!(status.pending_count, 1);

    fleet.broker.set_reachable(true);
    fleet.settle().await.unwrap();

    assert_eq!(fleet.master.engine.status().await.unwrap().pending_count, 0);
    let local = ship1(&fleet).content.get(&article(), &doc.id).await.unwrap();
    assert_eq!(local.data, json!({"title": "storm warning"}));
}

#[tokio::test]
async fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ship-1.db");
    let broker = MemoryBroker::new();
    let master = master_node(&broker, fast_config(EngineConfig::master())).unwrap();
    let content = Arc::new(MemoryContentStore::new("ship-1"));
    let config = fast_config(EngineConfig::replica("ship-1"));

    broker.set_reachable(false);
    let doc = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let ship = ship_node(&broker, config.clone(), store, Arc::clone(&content)).unwrap();
        let doc = content
            .create(&article(), json!({"title": "before restart"}), Origin::Local)
            .await
            .unwrap();
        assert_eq!(ship.engine.status().await.unwrap().pending_count, 1);
        doc
    };
    broker.set_reachable(true);

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let ship = ship_node(&broker, config, store, Arc::clone(&content)).unwrap();
    assert_eq!(ship.engine.push_now().await.unwrap(), 1);
    master.engine.pump(PUMP_WAIT).await.unwrap();
    ship.engine.pump(PUMP_WAIT).await.unwrap();

    let copies = master.content.list(&article()).await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].data, json!({"title": "before restart"}));
    assert!(ship
        .engine
        .store()
        .get_mapping(ship.engine.ship_id(), &article(), &doc.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_tasks_sync_without_manual_pumping() {
    init_tracing();
    let fleet = Fleet::new(&["ship-1"]).unwrap();
    let ship = ship1(&fleet);
    fleet.master.engine.start().await.unwrap();
    ship.engine.start().await.unwrap();

    let doc = ship
        .content
        .create(&article(), json!({"title": "auto"}), Origin::Local)
        .await
        .unwrap();

    let master = &fleet.master;
    let doc_id = &doc.id;
    assert!(wait_for(|| async move { master.content.len().await == 1 }).await);
    assert!(
        wait_for(|| async move {
            ship.engine
                .store()
                .get_mapping(ship.engine.ship_id(), &article(), doc_id)
                .await
                .unwrap()
                .is_some()
        })
        .await
    );
    assert!(
        wait_for(|| async move {
            master
                .engine
                .ships()
                .await
                .unwrap()
                .iter()
                .any(|s| s.ship_id.as_str() == "ship-1")
        })
        .await
    );

    ship.engine.shutdown().await.unwrap();
    fleet.master.engine.shutdown().await.unwrap();
    assert!(!ship.engine.is_running().await);
    assert!(!fleet.master.engine.is_running().await);
}
