//! Role-selected engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use shipsync_core::NodeRole;
use shipsync_store::Store;
use shipsync_sync::Transport;

use crate::config::EngineConfig;
use crate::content::{ContentStore, Mutation, MutationHook};
use crate::error::Result;
use crate::lifecycle::SyncStatus;
use crate::master::MasterEngine;
use crate::replica::ReplicaEngine;

/// A master or replica engine, picked by [`EngineConfig::role`].
pub enum SyncEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    Master(MasterEngine<S, C, T>),
    Replica(ReplicaEngine<S, C, T>),
}

impl<S, C, T> SyncEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    /// Build the engine for the configured role.
    ///
    /// `producer` and `consumer` should be separate connections; the
    /// consumer's group is the node's identity on the broker.
    pub fn new(
        config: EngineConfig,
        store: Arc<S>,
        content: Arc<C>,
        producer: T,
        consumer: T,
    ) -> Result<Self> {
        match config.role {
            NodeRole::Master => Ok(Self::Master(MasterEngine::new(
                config, store, content, producer, consumer,
            )?)),
            NodeRole::Replica => Ok(Self::Replica(ReplicaEngine::new(
                config, store, content, producer, consumer,
            )?)),
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            Self::Master(_) => NodeRole::Master,
            Self::Replica(_) => NodeRole::Replica,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        match self {
            Self::Master(engine) => engine.config(),
            Self::Replica(engine) => engine.config(),
        }
    }

    pub fn as_master(&self) -> Option<&MasterEngine<S, C, T>> {
        match self {
            Self::Master(engine) => Some(engine),
            Self::Replica(_) => None,
        }
    }

    pub fn as_replica(&self) -> Option<&ReplicaEngine<S, C, T>> {
        match self {
            Self::Replica(engine) => Some(engine),
            Self::Master(_) => None,
        }
    }

    /// Feed a content mutation to the engine. Returns whether it will be
    /// synced.
    pub async fn handle_mutation(&self, mutation: &Mutation) -> Result<bool> {
        match self {
            Self::Master(engine) => Ok(engine.handle_mutation(mutation).await?.is_some()),
            Self::Replica(engine) => Ok(engine.handle_mutation(mutation).await?.is_some()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Master(engine) => engine.start().await,
            Self::Replica(engine) => engine.start().await,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self {
            Self::Master(engine) => engine.shutdown().await,
            Self::Replica(engine) => engine.shutdown().await,
        }
    }

    pub async fn is_running(&self) -> bool {
        match self {
            Self::Master(engine) => engine.is_running().await,
            Self::Replica(engine) => engine.is_running().await,
        }
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        match self {
            Self::Master(engine) => engine.status().await,
            Self::Replica(engine) => engine.status().await,
        }
    }

    /// Dispatch every delivery waiting on the role's inbound topic.
    pub async fn pump(&self, wait: Duration) -> Result<usize> {
        match self {
            Self::Master(engine) => engine.pump(wait).await,
            Self::Replica(engine) => engine.pump(wait).await,
        }
    }
}

#[async_trait]
impl<S, C, T> MutationHook for SyncEngine<S, C, T>
where
    S: Store + 'static,
    C: ContentStore + 'static,
    T: Transport + 'static,
{
    async fn on_mutation(&self, mutation: &Mutation) {
        match self {
            Self::Master(engine) => engine.on_mutation(mutation).await,
            Self::Replica(engine) => engine.on_mutation(mutation).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::memory::MemoryContentStore;
    use crate::content::Origin;
    use serde_json::json;
    use shipsync_core::ContentType;
    use shipsync_store::MemoryStore;
    use shipsync_sync::{MemoryBroker, MemoryTransport};

    type Engine = SyncEngine<MemoryStore, MemoryContentStore, MemoryTransport>;

    fn build(config: EngineConfig) -> Result<Engine> {
        let broker = MemoryBroker::new();
        Engine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryContentStore::new("d")),
            broker.create_transport("producer"),
            broker.create_transport("consumer"),
        )
    }

    #[tokio::test]
    async fn test_role_selects_engine() {
        let master = build(EngineConfig::master()).unwrap();
        assert_eq!(master.role(), NodeRole::Master);
        assert!(master.as_master().is_some());
        assert!(master.as_replica().is_none());

        let replica = build(EngineConfig::replica("ship-1")).unwrap();
        assert_eq!(replica.role(), NodeRole::Replica);
        assert_eq!(replica.config().ship_id.as_str(), "ship-1");
    }

    #[tokio::test]
    async fn test_replica_status_counts_queue() {
        let engine = build(EngineConfig::replica("ship-1")).unwrap();
        let mutation = Mutation {
            action: crate::content::MutationAction::Create,
            content_type: ContentType::new("api::log.log"),
            document_id: Some("d-1".into()),
            data: Some(json!({"entry": "noon position"})),
            updated_at: 1,
            origin: Origin::Local,
        };
        assert!(engine.handle_mutation(&mutation).await.unwrap());

        let status = engine.status().await.unwrap();
        assert_eq!(status.mode, NodeRole::Replica);
        assert_eq!(status.pending_count, 1);
        assert!(!status.connected);
    }
}
