//! Turning host mutations into sync operations.

use serde_json::Value;
use tracing::{debug, warn};

use shipsync_core::{sanitize, ContentType, DocumentId, Operation, Timestamp};

use crate::content::{Mutation, MutationAction};

/// A mutation that should be synced.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedChange {
    pub operation: Operation,
    pub content_type: ContentType,
    pub document_id: DocumentId,
    /// Sanitized document data; `None` for deletes.
    pub payload: Option<Value>,
    pub version: Timestamp,
}

/// Decides which mutations are synced and prepares their payloads.
#[derive(Debug, Clone, Default)]
pub struct MutationFilter {
    excluded_prefixes: Vec<String>,
}

impl MutationFilter {
    pub fn new(excluded_prefixes: Vec<String>) -> Self {
        Self { excluded_prefixes }
    }

    pub fn is_excluded(&self, content_type: &ContentType) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| content_type.as_str().starts_with(prefix.as_str()))
    }

    /// Map a mutation to the operation to sync, if any.
    ///
    /// Internal content types, unpublish events and mutations without a
    /// resolvable document id are dropped. Publishing syncs as an update.
    /// Origin is not considered here.
    pub fn classify(&self, mutation: &Mutation) -> Option<TrackedChange> {
        if self.is_excluded(&mutation.content_type) {
            debug!(content_type = %mutation.content_type, "content type not synced");
            return None;
        }

        let operation = match mutation.action {
            MutationAction::Create => Operation::Create,
            MutationAction::Update | MutationAction::Publish => Operation::Update,
            MutationAction::Delete => Operation::Delete,
            MutationAction::Unpublish => return None,
        };

        let Some(document_id) = mutation.document_id() else {
            warn!(
                content_type = %mutation.content_type,
                action = ?mutation.action,
                "mutation without document id not synced"
            );
            return None;
        };

        let payload = match operation {
            Operation::Delete => None,
            Operation::Create | Operation::Update => match &mutation.data {
                Some(data @ Value::Object(_)) => Some(sanitize(data)),
                _ => {
                    warn!(
                        content_type = %mutation.content_type,
                        %document_id,
                        "mutation without document data not synced"
                    );
                    return None;
                }
            },
        };

        Some(TrackedChange {
            operation,
            content_type: mutation.content_type.clone(),
            document_id,
            payload,
            version: mutation.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Origin;
    use serde_json::json;

    fn filter() -> MutationFilter {
        MutationFilter::new(vec!["admin::".into(), "plugin::".into()])
    }

    fn mutation(action: MutationAction, content_type: &str) -> Mutation {
        Mutation {
            action,
            content_type: ContentType::new(content_type),
            document_id: Some(DocumentId::new("d-1")),
            data: Some(json!({"title": "Menu", "password": "hunter2"})),
            updated_at: 42,
            origin: Origin::Local,
        }
    }

    #[test]
    fn test_action_mapping() {
        let f = filter();
        let op = |a| f.classify(&mutation(a, "api::menu.menu")).map(|c| c.operation);
        assert_eq!(op(MutationAction::Create), Some(Operation::Create));
        assert_eq!(op(MutationAction::Update), Some(Operation::Update));
        assert_eq!(op(MutationAction::Publish), Some(Operation::Update));
        assert_eq!(op(MutationAction::Delete), Some(Operation::Delete));
        assert_eq!(op(MutationAction::Unpublish), None);
    }

    #[test]
    fn test_internal_types_excluded() {
        let f = filter();
        assert!(f.classify(&mutation(MutationAction::Create, "admin::user")).is_none());
        assert!(f
            .classify(&mutation(MutationAction::Update, "plugin::upload.file"))
            .is_none());
    }

    #[test]
    fn test_payload_sanitized() {
        let change = filter()
            .classify(&mutation(MutationAction::Update, "api::menu.menu"))
            .unwrap();
        assert_eq!(change.payload, Some(json!({"title": "Menu"})));
        assert_eq!(change.version, 42);
    }

    #[test]
    fn test_delete_carries_no_payload() {
        let change = filter()
            .classify(&mutation(MutationAction::Delete, "api::menu.menu"))
            .unwrap();
        assert_eq!(change.payload, None);
    }

    #[test]
    fn test_unidentifiable_mutation_dropped() {
        let mut m = mutation(MutationAction::Update, "api::menu.menu");
        m.document_id = None;
        m.data = Some(json!({"title": "no id"}));
        assert!(filter().classify(&m).is_none());
    }
}
