//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

use shipsync::content::memory::MemoryContentStore;
use shipsync::{ContentStore, Origin, Result};
use shipsync_core::{ContentType, DocumentId};

/// Content types the generators draw from.
pub const CONTENT_TYPES: &[&str] = &["api::article.article", "api::log.log", "api::crew.crew"];

/// Document slots an edit script addresses.
pub const SLOTS: usize = 4;

pub fn content_type() -> impl Strategy<Value = ContentType> {
    prop::sample::select(CONTENT_TYPES).prop_map(|name| ContentType::new(name))
}

/// Generate a plain field name that is never on the sensitive list.
pub fn field_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}".prop_map(|s| format!("f_{s}"))
}

pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::String),
    ]
}

/// Generate a document body, sometimes carrying a credential field.
pub fn payload() -> impl Strategy<Value = Value> {
    (
        prop::collection::btree_map(field_name(), scalar(), 1..6),
        prop::option::of(prop::sample::select(&["password", "apiKey", "secret"][..])),
    )
        .prop_map(|(fields, sensitive)| {
            let mut map: Map<String, Value> = fields.into_iter().collect();
            if let Some(key) = sensitive {
                map.insert(key.to_string(), Value::String("do-not-sync".into()));
            }
            Value::Object(map)
        })
}

/// One local edit on a ship.
#[derive(Debug, Clone)]
pub enum ShipEdit {
    /// Create a document in an empty slot, or update the slot's document.
    Write { slot: usize, data: Value },
    Delete { slot: usize },
    /// Let the fleet exchange messages before the next edit.
    Sync,
}

pub fn ship_edit() -> impl Strategy<Value = ShipEdit> {
    prop_oneof![
        4 => (0..SLOTS, payload()).prop_map(|(slot, data)| ShipEdit::Write { slot, data }),
        1 => (0..SLOTS).prop_map(|slot| ShipEdit::Delete { slot }),
        1 => Just(ShipEdit::Sync),
    ]
}

pub fn edit_script(max_len: usize) -> impl Strategy<Value = Vec<ShipEdit>> {
    prop::collection::vec(ship_edit(), 1..=max_len)
}

/// Live documents per slot while a script runs.
#[derive(Debug, Default)]
pub struct Slots {
    docs: [Option<DocumentId>; SLOTS],
}

impl Slots {
    pub fn live(&self) -> impl Iterator<Item = &DocumentId> {
        self.docs.iter().flatten()
    }

    /// Apply a content edit as a local write. [`ShipEdit::Sync`] is the
    /// caller's business and ignored here.
    pub async fn apply(
        &mut self,
        content: &MemoryContentStore,
        content_type: &ContentType,
        edit: &ShipEdit,
    ) -> Result<()> {
        match edit {
            ShipEdit::Write { slot, data } => match self.docs[*slot].clone() {
                Some(id) => {
                    content
                        .update(content_type, &id, data.clone(), Origin::Local)
                        .await?;
                }
                None => {
                    let doc = content
                        .create(content_type, data.clone(), Origin::Local)
                        .await?;
                    self.docs[*slot] = Some(doc.id);
                }
            },
            ShipEdit::Delete { slot } => {
                if let Some(id) = self.docs[*slot].take() {
                    content.delete(content_type, &id, Origin::Local).await?;
                }
            }
            ShipEdit::Sync => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipsync_core::{is_sensitive_key, sanitize};

    proptest! {
        #[test]
        fn test_field_names_are_never_sensitive(name in field_name()) {
            prop_assert!(!is_sensitive_key(&name));
        }

        #[test]
        fn test_sanitized_payload_keeps_plain_fields(data in payload()) {
            let clean = sanitize(&data);
            let fields = clean.as_object().unwrap();
            for (key, value) in data.as_object().unwrap() {
                if is_sensitive_key(key) {
                    prop_assert!(!fields.contains_key(key));
                } else {
                    prop_assert_eq!(fields.get(key), Some(value));
                }
            }
        }
    }
}
