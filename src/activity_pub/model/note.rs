//! Notes with their embedded `likes` and `replies` collections.
//!
//! Remote software sends `likes` either as a bare array of IRIs or as a
//! collection object. Both are normalized into [`EmbeddedCollection`] when a
//! note is loaded, and always written back as an `OrderedCollection`.

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EmbeddedCollection {
    id: Option<String>,
    items: Vec<String>,
}

impl EmbeddedCollection {
    fn from_value(value: &Value) -> EmbeddedCollection {
        let iri = |v: &Value| {
            v.as_str()
                .or_else(|| v.get("id").and_then(Value::as_str))
                .map(str::to_string)
        };
        let (id, raw_items) = match value {
            Value::Array(array) => (None, array.as_slice()),
            Value::Object(map) => {
                let items = map
                    .get("orderedItems")
                    .or_else(|| map.get("items"))
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                (map.get("id").and_then(Value::as_str).map(str::to_string), items)
            }
            _ => (None, &[][..]),
        };
        let mut collection = EmbeddedCollection {
            id,
            items: Vec::with_capacity(raw_items.len()),
        };
        for item in raw_items.iter().filter_map(iri) {
            collection.insert(item);
        }
        collection
    }
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        map.insert("type".to_string(), json!("OrderedCollection"));
        map.insert("totalItems".to_string(), json!(self.items.len()));
        map.insert("orderedItems".to_string(), json!(self.items));
        Value::Object(map)
    }
    pub(crate) fn items(&self) -> &[String] {
        &self.items
    }
    pub(crate) fn total_items(&self) -> usize {
        self.items.len()
    }
    pub(crate) fn contains(&self, iri: &str) -> bool {
        self.items.iter().any(|it| it == iri)
    }
    /// Appends `iri` unless already present. Returns whether anything changed.
    pub(crate) fn insert(&mut self, iri: impl Into<String>) -> bool {
        let iri = iri.into();
        if self.contains(&iri) {
            return false;
        }
        self.items.push(iri);
        true
    }
    /// Removes `iri` if present. Returns whether anything changed.
    pub(crate) fn remove(&mut self, iri: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|it| it != iri);
        before != self.items.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Note {
    properties: Map<String, Value>,
    likes: Option<EmbeddedCollection>,
    replies: Option<EmbeddedCollection>,
}

impl TryFrom<Value> for Note {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(mut properties) = value else {
            bail!("note must be a JSON object");
        };
        if properties.get("id").and_then(Value::as_str).is_none() {
            bail!("note must have an id");
        }
        let likes = properties
            .remove("likes")
            .map(|v| EmbeddedCollection::from_value(&v));
        let replies = properties
            .remove("replies")
            .map(|v| EmbeddedCollection::from_value(&v));
        Ok(Note {
            properties,
            likes,
            replies,
        })
    }
}

impl From<Note> for Value {
    fn from(note: Note) -> Self {
        let Note {
            mut properties,
            likes,
            replies,
        } = note;
        if let Some(likes) = likes {
            properties.insert("likes".to_string(), likes.to_value());
        }
        if let Some(replies) = replies {
            properties.insert("replies".to_string(), replies.to_value());
        }
        Value::Object(properties)
    }
}

impl Note {
    pub(crate) fn id(&self) -> &str {
        self.properties
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
    pub(crate) fn likes(&self) -> Option<&EmbeddedCollection> {
        self.likes.as_ref()
    }
    pub(crate) fn replies(&self) -> Option<&EmbeddedCollection> {
        self.replies.as_ref()
    }
    pub(crate) fn add_like(&mut self, actor: &str) -> bool {
        self.likes.get_or_insert_with(Default::default).insert(actor)
    }
    pub(crate) fn remove_like(&mut self, actor: &str) -> bool {
        self.likes.as_mut().is_some_and(|likes| likes.remove(actor))
    }
    pub(crate) fn add_reply(&mut self, note_id: &str) -> bool {
        self.replies
            .get_or_insert_with(Default::default)
            .insert(note_id)
    }
}
