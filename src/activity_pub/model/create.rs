use anyhow::{Result, bail};
use jiff::Timestamp;
use serde_json::{Value, json};

use super::Object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Create<'a>(Object<'a>);

impl TryFrom<Object<'_>> for Create<'static> {
    type Error = anyhow::Error;

    /// Accepts a `Create` activity as is, or wraps a bare object into one.
    fn try_from(object: Object<'_>) -> Result<Self> {
        if object.type_is("Create") {
            if object.get_node_object("object").is_none() {
                bail!("Create activity must embed its object");
            }
            return Ok(Create(object.into_owned()));
        }

        if !object.has_props(&["type"]) {
            bail!("Object must have type property");
        }
        let mut object = object.to_value();
        let context = object
            .as_object_mut()
            .and_then(|map| map.remove("@context"))
            .unwrap_or_else(|| json!("https://www.w3.org/ns/activitystreams"));
        let object = Object::from(object);

        let mut create = json!({
            "@context": context,
            "type": "Create",
            "published": Timestamp::now().to_string(),
        });

        if let Some(map) = create.as_object_mut() {
            for prop in ["to", "bto", "cc", "bcc", "audience", "published"] {
                if let Some(v) = object.get_value(prop) {
                    map.insert(prop.to_string(), v);
                }
            }
            map.insert("object".to_string(), object.into());
        }

        Ok(Create(Object::from(create)))
    }
}

impl Create<'_> {
    pub(crate) fn with_actor(self, actor_iri: impl Into<String>) -> Create<'static> {
        let value = Value::String(actor_iri.into());
        let obj = self
            .0
            .augment("actor", value.clone())
            .augment_node("object", "attributedTo", value);
        Create(obj)
    }
    pub(crate) fn get_object(&self) -> Option<Object<'_>> {
        self.0.get_node_object("object")
    }
    /// Replaces the embedded object, e.g. after assigning it an id.
    pub(crate) fn with_object(self, object: Value) -> Create<'static> {
        Create(self.0.replace("object", object))
    }
    /// Copies the object's addressing onto the activity where it has none.
    pub(crate) fn with_object_addressing(self) -> Create<'static> {
        let addressing: Vec<(&str, Value)> = ["to", "cc"]
            .into_iter()
            .filter_map(|prop| {
                self.get_object()
                    .and_then(|obj| obj.get_value(prop))
                    .map(|v| (prop, v))
            })
            .collect();
        let mut obj = self.0.into_owned();
        for (prop, value) in addressing {
            obj = obj.augment(prop, value);
        }
        Create(obj)
    }
}

impl<'a> From<Create<'a>> for Object<'a> {
    fn from(value: Create<'a>) -> Self {
        value.0
    }
}

impl From<Create<'_>> for Value {
    fn from(value: Create<'_>) -> Self {
        value.0.to_value()
    }
}
