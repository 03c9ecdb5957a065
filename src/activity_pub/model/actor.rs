use serde_json::{Value, json};

use crate::config::ActivityPubConfig;

use super::Object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Actor<'a>(Object<'a>);

/// User supplied parts of a local actor.
#[derive(Debug, Clone, Default)]
pub(crate) struct Profile {
    pub(crate) username: String,
    pub(crate) name: Option<String>,
    pub(crate) summary: Option<String>,
    pub(crate) icon: Option<String>,
}

impl<'a> From<Object<'a>> for Actor<'a> {
    fn from(object: Object<'a>) -> Self {
        Actor(object)
    }
}

impl Actor<'static> {
    /// Builds the `Person` document of a local user.
    pub(crate) fn local(
        config: &ActivityPubConfig,
        profile: &Profile,
        public_key_pem: &str,
    ) -> Actor<'static> {
        let id = config.actor_iri(&profile.username);
        let mut person = json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "type": "Person",
            "id": id,
            "preferredUsername": profile.username,
            "name": profile.name.as_deref().unwrap_or(&profile.username),
            "summary": profile.summary.as_deref().unwrap_or_default(),
            "inbox": format!("{id}/inbox"),
            "outbox": format!("{id}/outbox"),
            "followers": format!("{id}/followers"),
            "following": format!("{id}/following"),
            "publicKey": {
                "id": format!("{id}#main-key"),
                "owner": id,
                "publicKeyPem": public_key_pem
            }
        });
        if let (Some(icon), Some(map)) = (&profile.icon, person.as_object_mut()) {
            map.insert("icon".to_string(), json!({"type": "Image", "url": icon}));
        }
        Actor(Object::from(person))
    }
}

impl Actor<'_> {
    pub(crate) fn id(&self) -> Option<&str> {
        self.0.id()
    }
    pub(crate) fn inbox(&self) -> Option<&str> {
        self.0.get_str("inbox")
    }
    pub(crate) fn followers(&self) -> Option<&str> {
        self.0.get_str("followers")
    }
    /// Whether the document is a standalone key rather than an actor.
    pub(crate) fn is_key(&self) -> bool {
        self.0.type_is("Key") || self.0.type_is("CryptographicKey")
    }
    /// PEM of the actor's key; the document may also be the key itself.
    pub(crate) fn public_key_pem(&self) -> Option<&str> {
        if self.is_key() {
            return self.0.get_str("publicKeyPem");
        }
        self.0
            .as_ref()
            .get("publicKey")
            .and_then(|key| key.get("publicKeyPem"))
            .and_then(Value::as_str)
    }
    pub(crate) fn key_owner(&self) -> Option<&str> {
        if self.is_key() {
            return self.0.get_str("owner");
        }
        self.0
            .as_ref()
            .get("publicKey")
            .and_then(|key| key.get("owner"))
            .and_then(Value::as_str)
            .or_else(|| self.id())
    }
}

impl From<Actor<'_>> for Value {
    fn from(value: Actor<'_>) -> Self {
        value.0.to_value()
    }
}
