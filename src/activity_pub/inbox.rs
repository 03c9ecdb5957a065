//! Applies activities delivered to a local actor's inbox.
//!
//! Processing never fails the delivery: anything that cannot be applied is
//! logged and dropped, the activity itself is still recorded in the Pod inbox.

use reqwest::Url;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::pod::Container;
use crate::session::{FetchCache, IdentityProvider};

use super::keys;
use super::mailman::Mailman;
use super::model::{AS_CONTEXT, Note, Object};
use super::repo::{ActorLocation, Directory, normalize_username};
use super::social::Social;

/// The local note an activity refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PostPath {
    pub(crate) username: String,
    pub(crate) status_id: String,
}

impl PostPath {
    pub(crate) fn storage_key(&self) -> String {
        format!("{}/{}", self.username, self.status_id)
    }
}

/// Maps a note IRI of this server (`{base}/actors/{username}/status/{id}`,
/// or the legacy `statuses`) to its owner and status id.
pub(crate) fn extract_post_path(iri: &str, base_url: &str) -> Option<PostPath> {
    let iri = Url::parse(iri).ok()?;
    let base = Url::parse(base_url).ok()?;
    if iri.origin() != base.origin() {
        return None;
    }
    let rest = iri.path().strip_prefix(base.path().trim_end_matches('/'))?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["actors", username, "status" | "statuses", status_id] => Some(PostPath {
            username: normalize_username(username).ok()?,
            status_id: status_id.to_string(),
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Liked { changed: bool },
    Unliked { changed: bool },
    Replied { changed: bool },
    Followed { accepted: bool },
    FollowAccepted,
    Recorded,
    Dropped(&'static str),
}

pub(crate) struct InboxProcessor<'a, P> {
    pub(crate) config: &'a Config,
    pub(crate) directory: &'a Directory,
    pub(crate) cache: &'a FetchCache<P>,
    pub(crate) mailman: &'a Mailman,
}

impl<P: IdentityProvider> InboxProcessor<'_, P> {
    async fn open(&self, owner: &ActorLocation) -> Option<Social> {
        match Social::for_owner(self.cache, owner, &self.config.pod.app_container).await {
            Ok(social) => Some(social),
            Err(error) => {
                warn!(target: "apub", web_id = %owner.web_id, error = format!("{error:#}"), "pod unavailable");
                None
            }
        }
    }

    /// Records `activity` in the owner's inbox and applies its effects.
    pub(crate) async fn process(&self, owner: &ActorLocation, activity: &Value) -> Outcome {
        let Some(social) = self.open(owner).await else {
            return Outcome::Dropped("owner pod unavailable");
        };
        if social.store(Container::Inbox, activity, None).await.is_none() {
            warn!(target: "apub", owner = %owner.actor_id, "unable to record inbox activity");
        }

        let object = Object::from(activity);
        let Some(actor) = object.get_node_iri("actor") else {
            return Outcome::Dropped("activity has no actor");
        };
        let outcome = match object.get_first_type().unwrap_or_default() {
            "Like" => match object.get_node_iri("object") {
                Some(target) => self
                    .update_note(target, |note| note.add_like(actor))
                    .await
                    .map_or_else(Outcome::Dropped, |changed| Outcome::Liked { changed }),
                None => Outcome::Dropped("like without object"),
            },
            "Undo" => self.undo(&object, actor).await,
            "Create" => self.reply(&object).await,
            "Follow" => self.follow(owner, &social, &object, actor).await,
            "Accept" => self.accept(owner, &social, &object, actor).await,
            _ => Outcome::Recorded,
        };
        match &outcome {
            Outcome::Dropped(reason) => {
                warn!(target: "apub", id = object.id(), actor, reason, "inbox activity dropped")
            }
            outcome => debug!(target: "apub", id = object.id(), actor, ?outcome, "inbox activity applied"),
        }
        outcome
    }

    /// Loads the local note `target`, applies `f` and saves it when it changed.
    async fn update_note(
        &self,
        target: &str,
        f: impl FnOnce(&mut Note) -> bool,
    ) -> Result<bool, &'static str> {
        let path = extract_post_path(target, &self.config.activity_pub.base_url)
            .ok_or("target is not a local note")?;
        let owner = match self.directory.lookup(&path.username) {
            Ok(Some(owner)) => owner,
            Ok(None) => return Err("note owner is not registered"),
            Err(error) => {
                warn!(target: "apub", %error, "directory lookup failed");
                return Err("directory unavailable");
            }
        };
        let social = self.open(&owner).await.ok_or("note owner pod unavailable")?;
        let mut stored = social
            .load_note(&path.status_id)
            .await
            .ok_or("note not found")?;
        if !f(&mut stored.note) {
            return Ok(false);
        }
        if let Err(error) = social.save_note(stored).await {
            warn!(target: "apub", note = %path.storage_key(), error = format!("{error:#}"), "unable to save note");
            return Err("note could not be saved");
        }
        Ok(true)
    }

    async fn undo(&self, object: &Object<'_>, actor: &str) -> Outcome {
        let Some(inner) = object.get_node_object("object") else {
            return Outcome::Recorded;
        };
        if !inner.type_is("Like") {
            return Outcome::Recorded;
        }
        if inner.get_node_iri("actor").is_some_and(|liker| liker != actor) {
            return Outcome::Dropped("undo of another actor's like");
        }
        match inner.get_node_iri("object") {
            Some(target) => self
                .update_note(target, |note| note.remove_like(actor))
                .await
                .map_or_else(Outcome::Dropped, |changed| Outcome::Unliked { changed }),
            None => Outcome::Dropped("undone like without object"),
        }
    }

    async fn reply(&self, object: &Object<'_>) -> Outcome {
        let Some(note) = object.get_node_object("object") else {
            return Outcome::Recorded;
        };
        let (Some(parent), Some(note_id)) = (note.get_node_iri("inReplyTo"), note.id()) else {
            return Outcome::Recorded;
        };
        self.update_note(parent, |parent| parent.add_reply(note_id))
            .await
            .map_or_else(Outcome::Dropped, |changed| Outcome::Replied { changed })
    }

    async fn follow(
        &self,
        owner: &ActorLocation,
        social: &Social,
        object: &Object<'_>,
        follower: &str,
    ) -> Outcome {
        if object.get_node_iri("object") != Some(owner.actor_id.as_str()) {
            return Outcome::Dropped("follow addressed to another actor");
        }
        if let Err(error) = social.add_follower(follower).await {
            warn!(target: "apub", %follower, error = format!("{error:#}"), "unable to store follower");
            return Outcome::Dropped("follower list not writable");
        }
        info!(target: "apub", actor = %owner.actor_id, %follower, "new follower");

        let inbox = match self.mailman.resolve_inbox(follower).await {
            Ok(inbox) => inbox,
            Err(error) => {
                warn!(target: "apub", %follower, error = format!("{error:#}"), "follower inbox unknown, accept not sent");
                return Outcome::Followed { accepted: false };
            }
        };
        let key = match keys::load_from_pod(social.pod(), social.layout(), &owner.actor_id).await
        {
            Ok(key) => key,
            Err(error) => {
                warn!(target: "apub", actor = %owner.actor_id, error = format!("{error:#}"), "signing key unavailable");
                return Outcome::Followed { accepted: false };
            }
        };
        let slug = Uuid::now_v7().simple().to_string();
        let accept = json!({
            "@context": AS_CONTEXT,
            "id": format!("{}/activities/{slug}", owner.actor_id),
            "type": "Accept",
            "actor": owner.actor_id,
            "object": object.to_value(),
            "to": [follower],
        });
        if social
            .store(Container::Activities, &accept, Some(&slug))
            .await
            .is_none()
        {
            warn!(target: "apub", actor = %owner.actor_id, "unable to record accept activity");
        }
        match self.mailman.post_signed(&inbox, &accept, &key).await {
            Ok(status) if status.is_success() => Outcome::Followed { accepted: true },
            Ok(status) => {
                warn!(target: "apub", %inbox, %status, "accept rejected");
                Outcome::Followed { accepted: false }
            }
            Err(error) => {
                warn!(target: "apub", %inbox, error = format!("{error:#}"), "accept delivery failed");
                Outcome::Followed { accepted: false }
            }
        }
    }

    async fn accept(
        &self,
        owner: &ActorLocation,
        social: &Social,
        object: &Object<'_>,
        followed: &str,
    ) -> Outcome {
        let ours = match object.get_node_object("object") {
            Some(follow) => {
                follow.type_is("Follow")
                    && follow.get_node_iri("actor") == Some(owner.actor_id.as_str())
            }
            None => object
                .get_node_iri("object")
                .is_some_and(|id| id.starts_with(&format!("{}/", owner.actor_id))),
        };
        if !ours {
            return Outcome::Recorded;
        }
        match social.add_following(followed).await {
            Ok(_) => Outcome::FollowAccepted,
            Err(error) => {
                warn!(target: "apub", %followed, error = format!("{error:#}"), "unable to store following");
                Outcome::Dropped("following list not writable")
            }
        }
    }
}
