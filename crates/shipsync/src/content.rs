//! The seam between the engine and the host CMS.
//!
//! The engine reads and writes documents through [`ContentStore`] and is
//! told about every mutation through [`MutationHook`]. Each write carries an
//! [`Origin`]; the store reports it back on the resulting [`Mutation`], which
//! is how changes applied by the engine are kept from being synced again.

use async_trait::async_trait;
use serde_json::Value;

use shipsync_core::{ContentType, DocumentId, Timestamp};

/// Who caused a content mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An editor on this node.
    Local,
    /// The engine, applying a change received from the master.
    Master,
    /// The engine, applying a change received from a ship.
    Ship,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Master => "master",
            Origin::Ship => "ship",
        }
    }

    /// Only local edits are ever synced.
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub content_type: ContentType,
    pub data: Value,
    /// Strictly increasing per store; compared against mapping watermarks.
    pub updated_at: Timestamp,
    pub published: bool,
}

/// Document lifecycle events reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
    Publish,
    Unpublish,
}

/// One completed document write.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub action: MutationAction,
    pub content_type: ContentType,
    pub document_id: Option<DocumentId>,
    /// Document data after the write; `None` for deletes.
    pub data: Option<Value>,
    pub updated_at: Timestamp,
    pub origin: Origin,
}

impl Mutation {
    /// The affected document id, falling back to `documentId` or `id` in the
    /// data.
    pub fn document_id(&self) -> Option<DocumentId> {
        if let Some(id) = &self.document_id {
            return Some(id.clone());
        }
        let data = self.data.as_ref()?;
        ["documentId", "id"]
            .iter()
            .filter_map(|key| data.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(DocumentId::new(s.as_str())),
                Value::Number(n) => Some(DocumentId::new(n.to_string())),
                _ => None,
            })
    }
}

/// Document persistence provided by the host CMS.
///
/// Every write must notify the registered [`MutationHook`] with the origin
/// it was called with.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(
        &self,
        content_type: &ContentType,
        data: Value,
        origin: Origin,
    ) -> anyhow::Result<Document>;

    async fn update(
        &self,
        content_type: &ContentType,
        id: &DocumentId,
        data: Value,
        origin: Origin,
    ) -> anyhow::Result<Document>;

    async fn delete(
        &self,
        content_type: &ContentType,
        id: &DocumentId,
        origin: Origin,
    ) -> anyhow::Result<()>;

    async fn find_one(
        &self,
        content_type: &ContentType,
        id: &DocumentId,
    ) -> anyhow::Result<Option<Document>>;

    async fn publish(
        &self,
        content_type: &ContentType,
        id: &DocumentId,
        origin: Origin,
    ) -> anyhow::Result<Document>;
}

/// Receives every document mutation. Must not fail the host's write.
#[async_trait]
pub trait MutationHook: Send + Sync {
    async fn on_mutation(&self, mutation: &Mutation);
}

/// In-memory content store for tests and fixtures.
#[cfg(any(test, feature = "testing"))]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Mutex, Weak};

    use anyhow::{anyhow, bail};
    use tokio::sync::RwLock;

    use shipsync_core::now_millis;

    use super::*;

    type Key = (ContentType, DocumentId);

    /// Content store backed by a hash map, with a pluggable hook.
    ///
    /// `updated_at` is the wall clock, bumped past the previous write so two
    /// writes never share a timestamp.
    pub struct MemoryContentStore {
        id_prefix: String,
        documents: RwLock<HashMap<Key, Document>>,
        next_id: AtomicU64,
        last_write: Mutex<Timestamp>,
        rejecting: AtomicBool,
        hook: Mutex<Option<Weak<dyn MutationHook>>>,
    }

    impl MemoryContentStore {
        /// Create an empty store whose generated ids start with `id_prefix`.
        pub fn new(id_prefix: impl Into<String>) -> Self {
            Self {
                id_prefix: id_prefix.into(),
                documents: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                last_write: Mutex::new(0),
                rejecting: AtomicBool::new(false),
                hook: Mutex::new(None),
            }
        }

        /// Register the hook notified after every write.
        pub fn set_hook(&self, hook: Weak<dyn MutationHook>) {
            *self.hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
        }

        /// While set, every write fails as a validation error would.
        pub fn reject_writes(&self, rejecting: bool) {
            self.rejecting.store(rejecting, Ordering::SeqCst);
        }

        pub async fn get(&self, content_type: &ContentType, id: &DocumentId) -> Option<Document> {
            self.documents
                .read()
                .await
                .get(&(content_type.clone(), id.clone()))
                .cloned()
        }

        /// All documents of a type, least recently written first.
        pub async fn list(&self, content_type: &ContentType) -> Vec<Document> {
            let mut docs: Vec<Document> = self
                .documents
                .read()
                .await
                .values()
                .filter(|d| &d.content_type == content_type)
                .cloned()
                .collect();
            docs.sort_by_key(|d| d.updated_at);
            docs
        }

        pub async fn len(&self) -> usize {
            self.documents.read().await.len()
        }

        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }

        fn tick(&self) -> Timestamp {
            let mut last = self.last_write.lock().unwrap_or_else(|p| p.into_inner());
            *last = now_millis().max(*last + 1);
            *last
        }

        fn check_writable(&self, content_type: &ContentType) -> anyhow::Result<()> {
            if self.rejecting.load(Ordering::SeqCst) {
                bail!("validation error: {content_type} rejected the write");
            }
            Ok(())
        }

        async fn notify(
            &self,
            action: MutationAction,
            document: Option<&Document>,
            key: &Key,
            origin: Origin,
        ) {
            let hook = self
                .hook
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .as_ref()
                .and_then(Weak::upgrade);
            let Some(hook) = hook else {
                return;
            };
            let mutation = Mutation {
                action,
                content_type: key.0.clone(),
                document_id: Some(key.1.clone()),
                data: document.map(|d| d.data.clone()),
                updated_at: document.map(|d| d.updated_at).unwrap_or_else(|| self.tick()),
                origin,
            };
            hook.on_mutation(&mutation).await;
        }
    }

    #[async_trait]
    impl ContentStore for MemoryContentStore {
        async fn create(
            &self,
            content_type: &ContentType,
            data: Value,
            origin: Origin,
        ) -> anyhow::Result<Document> {
            self.check_writable(content_type)?;
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let document = Document {
                id: DocumentId::new(format!("{}-{}", self.id_prefix, n)),
                content_type: content_type.clone(),
                data,
                updated_at: self.tick(),
                published: false,
            };
            let key = (content_type.clone(), document.id.clone());
            self.documents.write().await.insert(key.clone(), document.clone());
            self.notify(MutationAction::Create, Some(&document), &key, origin).await;
            Ok(document)
        }

        async fn update(
            &self,
            content_type: &ContentType,
            id: &DocumentId,
            data: Value,
            origin: Origin,
        ) -> anyhow::Result<Document> {
            self.check_writable(content_type)?;
            let key = (content_type.clone(), id.clone());
            let document = {
                let mut documents = self.documents.write().await;
                let document = documents
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("document {content_type}/{id} not found"))?;
                document.data = data;
                document.updated_at = self.tick();
                document.clone()
            };
            self.notify(MutationAction::Update, Some(&document), &key, origin).await;
            Ok(document)
        }

        async fn delete(
            &self,
            content_type: &ContentType,
            id: &DocumentId,
            origin: Origin,
        ) -> anyhow::Result<()> {
            self.check_writable(content_type)?;
            let key = (content_type.clone(), id.clone());
            if self.documents.write().await.remove(&key).is_none() {
                bail!("document {content_type}/{id} not found");
            }
            self.notify(MutationAction::Delete, None, &key, origin).await;
            Ok(())
        }

        async fn find_one(
            &self,
            content_type: &ContentType,
            id: &DocumentId,
        ) -> anyhow::Result<Option<Document>> {
            Ok(self.get(content_type, id).await)
        }

        async fn publish(
            &self,
            content_type: &ContentType,
            id: &DocumentId,
            origin: Origin,
        ) -> anyhow::Result<Document> {
            self.check_writable(content_type)?;
            let key = (content_type.clone(), id.clone());
            let document = {
                let mut documents = self.documents.write().await;
                let document = documents
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("document {content_type}/{id} not found"))?;
                document.published = true;
                document.updated_at = self.tick();
                document.clone()
            };
            self.notify(MutationAction::Publish, Some(&document), &key, origin).await;
            Ok(document)
        }
    }
}
