//! A master and its ships wired over one in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use shipsync::content::memory::MemoryContentStore;
use shipsync::{
    ContentStore, Document, EngineConfig, MasterEngine, MutationHook, ReplicaEngine, Result,
};
use shipsync_core::{ContentType, DocumentId, ShipId};
use shipsync_store::{MemoryStore, Store};
use shipsync_sync::{
    HeartbeatConfig, MemoryBroker, MemoryTransport, MonitorConfig, PushConfig, TransportConfig,
};

/// Consumer group of the master.
pub const MASTER_GROUP: &str = "master";

/// How long a pump waits for the next delivery before it calls the topic drained.
pub const PUMP_WAIT: Duration = Duration::from_millis(20);

/// Rounds [`Fleet::settle`] runs before giving up on quiescence.
const SETTLE_ROUNDS: usize = 16;

pub type MasterFixtureEngine = MasterEngine<MemoryStore, MemoryContentStore, MemoryTransport>;
pub type ShipEngine<S = MemoryStore> = ReplicaEngine<S, MemoryContentStore, MemoryTransport>;

/// Timeouts and intervals short enough for tests.
pub fn fast_config(mut config: EngineConfig) -> EngineConfig {
    config.transport = TransportConfig {
        connect_timeout: Duration::from_millis(100),
        request_timeout: Duration::from_millis(100),
        max_retries: 2,
        retry_backoff: Duration::from_millis(2),
    };
    config.push = PushConfig {
        debounce: Duration::from_millis(10),
        auto_push_interval: Duration::from_millis(100),
        batch_size: 50,
    };
    config.monitor = MonitorConfig {
        probe_interval: Duration::from_millis(20),
    };
    config.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(100),
        missed_intervals: 3,
    };
    config.consumer_poll_interval = Duration::from_millis(10);
    config
}

/// A content store and the engine hooked to it.
pub struct Node<E> {
    pub content: Arc<MemoryContentStore>,
    pub engine: Arc<E>,
}

impl<E: MutationHook + 'static> Node<E> {
    fn hooked(content: Arc<MemoryContentStore>, engine: E) -> Self {
        let engine = Arc::new(engine);
        let hook: Arc<dyn MutationHook> = engine.clone();
        content.set_hook(Arc::downgrade(&hook));
        Self { content, engine }
    }
}

/// Build the master node.
pub fn master_node(
    broker: &Arc<MemoryBroker>,
    config: EngineConfig,
) -> Result<Node<MasterFixtureEngine>> {
    let content = Arc::new(MemoryContentStore::new("master"));
    let engine = MasterEngine::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::clone(&content),
        broker.create_transport("master-producer"),
        broker.create_transport(MASTER_GROUP),
    )?;
    Ok(Node::hooked(content, engine))
}

/// Build a ship over an existing store and content, as after a restart.
pub fn ship_node<S: Store + 'static>(
    broker: &Arc<MemoryBroker>,
    config: EngineConfig,
    store: Arc<S>,
    content: Arc<MemoryContentStore>,
) -> Result<Node<ShipEngine<S>>> {
    let ship_id = config.ship_id.clone();
    let engine = ReplicaEngine::new(
        config,
        store,
        Arc::clone(&content),
        broker.create_transport(format!("{ship_id}-producer")),
        broker.create_transport(ship_id.as_str()),
    )?;
    Ok(Node::hooked(content, engine))
}

/// One master and any number of ships on a shared broker.
pub struct Fleet {
    pub broker: Arc<MemoryBroker>,
    pub master: Node<MasterFixtureEngine>,
    pub ships: Vec<Node<ShipEngine>>,
}

impl Fleet {
    pub fn new(ship_ids: &[&str]) -> Result<Self> {
        Self::with_config(ship_ids, |_| {})
    }

    /// Build a fleet, letting `adjust` edit every node's config.
    pub fn with_config(ship_ids: &[&str], adjust: impl Fn(&mut EngineConfig)) -> Result<Self> {
        let broker = MemoryBroker::new();

        let mut config = fast_config(EngineConfig::master());
        adjust(&mut config);
        let master = master_node(&broker, config)?;

        let mut ships = Vec::with_capacity(ship_ids.len());
        for id in ship_ids {
            let mut config = fast_config(EngineConfig::replica(*id));
            adjust(&mut config);
            let content = Arc::new(MemoryContentStore::new(*id));
            ships.push(ship_node(
                &broker,
                config,
                Arc::new(MemoryStore::new()),
                content,
            )?);
        }

        Ok(Self {
            broker,
            master,
            ships,
        })
    }

    pub fn ship(&self, ship_id: &str) -> Option<&Node<ShipEngine>> {
        self.ships
            .iter()
            .find(|s| s.engine.ship_id().as_str() == ship_id)
    }

    /// Push, pump and flush on every node until a full round moves nothing.
    ///
    /// Returns the number of messages moved. Requires a reachable broker.
    pub async fn settle(&self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..SETTLE_ROUNDS {
            let mut moved = 0;
            for ship in &self.ships {
                moved += ship.engine.push_now().await?;
            }
            moved += self.master.engine.pump(PUMP_WAIT).await?;
            moved += self.master.engine.flush_outbound().await?;
            for ship in &self.ships {
                moved += ship.engine.pump(PUMP_WAIT).await?;
            }
            if moved == 0 {
                break;
            }
            total += moved;
        }
        Ok(total)
    }

    /// The master's copy of a ship document, found through the mapping.
    pub async fn master_copy(
        &self,
        ship_id: &str,
        content_type: &ContentType,
        replica_id: &DocumentId,
    ) -> Result<Option<Document>> {
        let mapping = self
            .master
            .engine
            .store()
            .get_mapping(&ShipId::new(ship_id), content_type, replica_id)
            .await?;
        match mapping {
            Some(mapping) => Ok(self
                .master
                .content
                .find_one(content_type, &mapping.master_document_id)
                .await?),
            None => Ok(None),
        }
    }
}
