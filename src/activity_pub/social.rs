//! A user's social data as stored in their Pod.
//!
//! Every update is a whole-resource read-modify-write without a
//! precondition; concurrent writers to the same resource race and the last
//! write wins.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::warn;

use crate::pod::{Container, PodClient, PodLayout};
use crate::session::{FetchCache, IdentityProvider};

use super::model::{Note, Object};
use super::repo::ActorLocation;

/// A Note loaded from the outbox, together with the `Create` activity
/// wrapping it when it is stored that way.
#[derive(Debug, Clone)]
pub(crate) struct StoredNote {
    status_id: String,
    envelope: Option<Value>,
    pub(crate) note: Note,
}

impl StoredNote {
    fn from_resource(status_id: &str, resource: Value) -> Result<StoredNote> {
        let object = Object::from(&resource);
        if object.type_is("Create") {
            let note = object
                .get_value("object")
                .filter(Value::is_object)
                .context("stored activity does not embed its note")?;
            return Ok(StoredNote {
                status_id: status_id.to_string(),
                note: Note::try_from(note)?,
                envelope: Some(resource),
            });
        }
        Ok(StoredNote {
            status_id: status_id.to_string(),
            note: Note::try_from(resource)?,
            envelope: None,
        })
    }

    fn into_document(self) -> Value {
        let note = Value::from(self.note);
        match self.envelope {
            Some(mut envelope) => {
                if let Some(map) = envelope.as_object_mut() {
                    map.insert("object".to_string(), note);
                }
                envelope
            }
            None => note,
        }
    }
}

pub(crate) struct Social {
    pod: PodClient,
    layout: PodLayout,
}

fn list_items(resource: Option<Value>) -> Vec<String> {
    resource
        .as_ref()
        .and_then(|list| list.get("orderedItems"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Social {
    pub(crate) fn new(pod: PodClient, layout: PodLayout) -> Social {
        Social { pod, layout }
    }
    /// Opens the Pod of a registered user with that user's credentials.
    pub(crate) async fn for_owner<P: IdentityProvider>(
        cache: &FetchCache<P>,
        owner: &ActorLocation,
        app_container: &str,
    ) -> Result<Social> {
        let pod = cache.pod_client(&owner.web_id).await?;
        Ok(Social::new(pod, PodLayout::new(&owner.pod_url, app_container)))
    }
    pub(crate) fn pod(&self) -> &PodClient {
        &self.pod
    }
    pub(crate) fn layout(&self) -> &PodLayout {
        &self.layout
    }

    /// Creates every app container with its access policy.
    pub(crate) async fn provision(&self, owner_web_id: &str) -> Result<()> {
        self.pod
            .ensure_container(
                self.layout.app_root(),
                owner_web_id,
                crate::pod::AclPolicy::PublicReadOwnerWrite,
            )
            .await?;
        for container in Container::ALL {
            self.pod
                .ensure_container(
                    &self.layout.container(container),
                    owner_web_id,
                    container.policy(),
                )
                .await?;
        }
        Ok(())
    }

    async fn add_to_list(&self, url: &str, iri: &str) -> Result<bool> {
        let mut items = list_items(self.pod.read_for_update(url).await?);
        if items.iter().any(|item| item == iri) {
            return Ok(false);
        }
        items.push(iri.to_string());
        self.pod
            .put_json(url, &json!({ "orderedItems": items }))
            .await?;
        Ok(true)
    }

    pub(crate) async fn followers(&self) -> Vec<String> {
        list_items(self.pod.read_resource(&self.layout.followers_list()).await)
    }
    pub(crate) async fn following(&self) -> Vec<String> {
        list_items(self.pod.read_resource(&self.layout.following_list()).await)
    }
    pub(crate) async fn add_follower(&self, actor_iri: &str) -> Result<bool> {
        self.add_to_list(&self.layout.followers_list(), actor_iri)
            .await
    }
    pub(crate) async fn add_following(&self, actor_iri: &str) -> Result<bool> {
        self.add_to_list(&self.layout.following_list(), actor_iri)
            .await
    }

    pub(crate) async fn read(&self, container: Container, slug: &str) -> Option<Value> {
        self.pod
            .read_resource(&self.layout.resource(container, slug))
            .await
    }

    pub(crate) async fn load_note(&self, status_id: &str) -> Option<StoredNote> {
        let resource = self.read(Container::Outbox, status_id).await?;
        match StoredNote::from_resource(status_id, resource) {
            Ok(note) => Some(note),
            Err(error) => {
                warn!(target: "apub", %status_id, error = format!("{error:#}"), "stored note is malformed");
                None
            }
        }
    }

    pub(crate) async fn save_note(&self, note: StoredNote) -> Result<()> {
        let url = self.layout.resource(Container::Outbox, &note.status_id);
        self.pod.put_json(&url, &note.into_document()).await
    }

    /// Writes an activity into `container` under `slug`.
    pub(crate) async fn store(
        &self,
        container: Container,
        activity: &Value,
        slug: Option<&str>,
    ) -> Option<String> {
        self.pod
            .write_resource(&self.layout.container(container), activity, slug)
            .await
    }

    /// Reads every resource of a container, newest slug first.
    ///
    /// Slugs are time-ordered, so reverse lexicographic order stands in for
    /// reverse chronological order.
    pub(crate) async fn list(&self, container: Container) -> Vec<Value> {
        let mut urls = self
            .pod
            .list_container(&self.layout.container(container))
            .await;
        urls.sort();
        urls.reverse();
        let mut items = Vec::with_capacity(urls.len());
        for url in urls {
            if let Some(item) = self.pod.read_resource(&url).await {
                items.push(item);
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use reqwest::Client;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::Social;
    use crate::pod::{Container, PodClient, PodLayout};
    use crate::testing::FakePod;

    async fn social() -> Result<(FakePod, Social)> {
        let pod = FakePod::start().await?;
        let layout = PodLayout::new(&format!("{}alice/", pod.root()), "social/");
        let social = Social::new(PodClient::anonymous(Client::new()), layout);
        Ok((pod, social))
    }

    #[tokio::test]
    async fn provision_creates_containers() -> Result<()> {
        let (pod, social) = social().await?;
        social.provision("https://id.example/alice#me").await?;
        for path in ["inbox/", "outbox/", "followers/", "following/", "activities/", "settings/", "profile/"] {
            assert!(pod.has_container(&format!("/alice/social/{path}")), "{path}");
        }
        assert!(
            pod.children("/alice/social/settings/").is_empty(),
            "acl documents are not listed"
        );
        // Provisioning twice is not an error.
        social.provision("https://id.example/alice#me").await?;
        Ok(())
    }

    #[tokio::test]
    async fn follower_list_is_a_set() -> Result<()> {
        let (pod, social) = social().await?;
        assert!(social.followers().await.is_empty());
        assert!(social.add_follower("https://y/users/carol").await?);
        assert!(!social.add_follower("https://y/users/carol").await?);
        assert!(social.add_follower("https://z/users/dave").await?);
        assert_eq!(
            social.followers().await,
            vec!["https://y/users/carol", "https://z/users/dave"]
        );
        assert_eq!(
            pod.get_json("/alice/social/followers/list"),
            Some(json!({"orderedItems": ["https://y/users/carol", "https://z/users/dave"]}))
        );
        assert!(social.following().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_list_is_not_overwritten() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alice/social/followers/list"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(205))
            .expect(0)
            .mount(&server)
            .await;
        let layout = PodLayout::new(&format!("{}/alice/", server.uri()), "social/");
        let social = Social::new(PodClient::anonymous(Client::new()), layout);

        assert!(social.add_follower("https://y/users/new").await.is_err());
        // Reads for display still degrade to empty.
        assert!(social.followers().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn note_round_trip_keeps_envelope() -> Result<()> {
        let (pod, social) = social().await?;
        let activity = json!({
            "id": "https://x/actors/alice/status/1/activity",
            "type": "Create",
            "actor": "https://x/actors/alice",
            "object": {"id": "https://x/actors/alice/status/1", "type": "Note", "content": "hi"}
        });
        pod.put_json("/alice/social/outbox/1", &activity);

        let mut stored = social.load_note("1").await.expect("note");
        assert!(stored.note.add_like("https://y/users/carol"));
        social.save_note(stored).await?;

        let saved = pod.get_json("/alice/social/outbox/1").expect("saved");
        assert_eq!(saved["type"], "Create");
        assert_eq!(saved["object"]["likes"]["totalItems"], 1);
        assert_eq!(saved["object"]["content"], "hi");
        assert!(social.load_note("missing").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn interleaved_updates_last_writer_wins() -> Result<()> {
        let (pod, social) = social().await?;
        pod.put_json(
            "/alice/social/outbox/1",
            &json!({
                "id": "https://x/actors/alice/status/1",
                "type": "Note",
                "likes": {"type": "OrderedCollection", "totalItems": 1, "orderedItems": ["https://y/users/carol"]}
            }),
        );

        // A Like and an Undo(Like) both read before either writes.
        let mut liking = social.load_note("1").await.expect("note");
        let mut undoing = social.load_note("1").await.expect("note");
        assert!(liking.note.add_like("https://z/users/dave"));
        assert!(undoing.note.remove_like("https://y/users/carol"));
        social.save_note(liking).await?;
        social.save_note(undoing).await?;

        // The second write drops the first one's like.
        let saved = pod.get_json("/alice/social/outbox/1").expect("saved");
        assert_eq!(saved["likes"]["orderedItems"], json!([]));
        assert_eq!(saved["likes"]["totalItems"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn listing_is_newest_slug_first() -> Result<()> {
        let (_pod, social) = social().await?;
        social.provision("https://id.example/alice#me").await?;
        for slug in ["0001", "0003", "0002"] {
            social
                .store(Container::Outbox, &json!({"slug": slug}), Some(slug))
                .await
                .expect("stored");
        }
        let slugs: Vec<_> = social
            .list(Container::Outbox)
            .await
            .into_iter()
            .map(|item| item["slug"].clone())
            .collect();
        assert_eq!(slugs, vec![json!("0003"), json!("0002"), json!("0001")]);
        Ok(())
    }
}
