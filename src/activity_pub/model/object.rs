//! Storage friendly presentation of Activity Streams' core data model.

use std::borrow::Cow;
use std::fmt::Display;

use serde_json::{Map, Value};

/// The public addressing collection, in all the spellings seen in the wild.
pub(crate) const PUBLIC: [&str; 3] = [
    "https://www.w3.org/ns/activitystreams#Public",
    "as:Public",
    "Public",
];

pub(crate) fn is_public_iri(iri: &str) -> bool {
    PUBLIC.contains(&iri)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Object<'a>(Cow<'a, Value>);

impl Object<'_> {
    pub(crate) fn id(&self) -> Option<&str> {
        self.get_str("id").or_else(|| self.get_str("@id"))
    }
    pub(crate) fn type_is(&self, ty: &str) -> bool {
        for prop in ["type", "@type"] {
            if let Some(Value::String(object_type)) = self.0.get(prop) {
                return object_type == ty;
            }
            if let Some(Value::Array(type_array)) = self.0.get(prop) {
                return type_array.iter().any(|v| v.as_str() == Some(ty));
            }
        }
        false
    }
    pub(crate) fn get_first_type(&self) -> Option<&str> {
        for prop in ["type", "@type"] {
            match self.0.get(prop) {
                Some(Value::String(object_type)) => return Some(object_type),
                Some(Value::Array(type_array)) => {
                    return type_array.iter().find_map(Value::as_str);
                }
                _ => {}
            }
        }
        None
    }
    pub(crate) fn has_props(&self, props: &[&str]) -> bool {
        if let Some(map) = self.0.as_object() {
            return props.iter().all(|&key| map.contains_key(key));
        }
        false
    }
    pub(crate) fn get_str(&self, prop: &str) -> Option<&str> {
        self.0.get(prop).and_then(Value::as_str)
    }
    pub(crate) fn get_value(&self, prop: &str) -> Option<Value> {
        self.0.get(prop).cloned()
    }
    /// A property that is either a single IRI or an array of IRIs.
    pub(crate) fn get_str_array(&self, prop: &str) -> Vec<&str> {
        match self.0.get(prop) {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(array)) => array
                .iter()
                .filter_map(|v| v.as_str().or_else(|| v.get("id").and_then(Value::as_str)))
                .collect(),
            _ => vec![],
        }
    }
    pub(crate) fn get_node_object(&self, prop: &str) -> Option<Object<'_>> {
        self.0
            .get(prop)
            .filter(|v| v.is_object())
            .map(Object::from)
    }
    pub(crate) fn get_node_iri(&self, prop: &str) -> Option<&str> {
        let v = self.0.get(prop)?;
        if let Some(s) = v.as_str() {
            return Some(s);
        }
        if v.is_object() {
            return v.get("id").and_then(Value::as_str);
        }
        // As shown in
        // https://www.w3.org/TR/activitystreams-vocabulary/#properties, a
        // node reference might be an array. We just use the first IRI.
        v.as_array()
            .and_then(|array| array.iter().find_map(Value::as_str))
    }
    /// Addressed to the public collection through `to` or `cc`.
    pub(crate) fn is_public(&self) -> bool {
        ["to", "cc"]
            .iter()
            .any(|prop| self.get_str_array(prop).into_iter().any(is_public_iri))
    }
    /// Addressed to `iri` through `to`, `cc` or as its author.
    pub(crate) fn is_addressed_to(&self, iri: &str) -> bool {
        ["to", "cc", "bto", "bcc"]
            .iter()
            .any(|prop| self.get_str_array(prop).contains(&iri))
            || self.get_node_iri("attributedTo") == Some(iri)
    }
    pub(crate) fn into_owned(self) -> Object<'static> {
        Object(Cow::Owned(self.0.into_owned()))
    }
    pub(crate) fn to_value(&self) -> Value {
        self.0.clone().into_owned()
    }
    pub(crate) fn replace(self, property: &str, value: Value) -> Object<'static> {
        let mut obj = self.0.into_owned();
        if let Some(obj_map) = obj.as_object_mut() {
            obj_map.insert(property.to_string(), value);
        }
        Object(Cow::Owned(obj))
    }
    pub(crate) fn augment(self, property: &str, value: Value) -> Object<'static> {
        let mut obj = self.0.into_owned();
        if let Some(obj_map) = obj.as_object_mut() {
            obj_map.entry(property).or_insert(value);
        }
        Object(Cow::Owned(obj))
    }
    pub(crate) fn augment_node(self, node: &str, property: &str, value: Value) -> Object<'static> {
        let mut obj = self.0.into_owned();
        if let Some(Value::Object(map)) = obj.get_mut(node) {
            map.entry(property).or_insert(value);
        }
        Object(Cow::Owned(obj))
    }
}

impl From<Value> for Object<'static> {
    fn from(value: Value) -> Self {
        if !value.is_object() {
            // XXX: it is an error to create an Object from anything but a JSON
            // object. It should be validated by upper layers. In case some slip
            // through, we will just replace them with an empty object.
            Object(Cow::Owned(Value::Object(Map::new())))
        } else {
            Object(Cow::Owned(value))
        }
    }
}

impl<'a> From<&'a Value> for Object<'a> {
    fn from(value: &'a Value) -> Self {
        if !value.is_object() {
            Object(Cow::Owned(Value::Object(Map::new())))
        } else {
            Object(Cow::Borrowed(value))
        }
    }
}

impl From<Object<'_>> for Value {
    fn from(value: Object) -> Self {
        value.0.into_owned()
    }
}

impl AsRef<Value> for Object<'_> {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl Display for Object<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
