//! Federation of activities posted by local users.

use std::collections::BTreeSet;
use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::pod::Container;

use super::keys::{self, SigningKey};
use super::mailman::Mailman;
use super::model::{ALLOWED_ACTIVITY_TYPES, AS_CONTEXT, Create, Object, is_public_iri};
use super::social::Social;

/// Per-recipient delivery outcome of one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct Federation {
    pub(crate) total: usize,
    pub(crate) successful: usize,
    pub(crate) failed: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct Submission {
    pub(crate) id: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) federated: Federation,
}

/// An activity ready to be stored under `slug` in the sender's outbox.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) slug: String,
    pub(crate) activity: Value,
}

fn mint_slug() -> String {
    Uuid::now_v7().simple().to_string()
}

/// The status id embedded in a note id minted for `sender`.
fn status_id_of<'a>(note_id: &'a str, sender: &str) -> Option<&'a str> {
    note_id
        .strip_prefix(sender)?
        .strip_prefix("/status/")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Validates an activity posted by `sender` and assigns its ids.
///
/// A `Create` gets its note stored under the note's status id, reusing the
/// one already embedded in the note id so that re-posting overwrites.
pub(crate) fn prepare(activity: Value, sender: &str) -> ApiResult<Prepared> {
    if !activity.is_object() {
        return Err(ApiError::Validation("activity must be a JSON object".into()));
    }
    let object = Object::from(activity);
    let kind = object
        .get_first_type()
        .ok_or_else(|| ApiError::Validation("activity must have a type".into()))?
        .to_string();
    if !ALLOWED_ACTIVITY_TYPES.contains(&kind.as_str()) {
        return Err(ApiError::Validation(format!(
            "Unsupported activity type: {kind}"
        )));
    }
    match object.get_node_iri("actor") {
        Some(actor) if actor == sender => {}
        Some(_) => {
            return Err(ApiError::Validation(
                "activity actor does not match the sender".into(),
            ));
        }
        None => return Err(ApiError::Validation("activity must have an actor".into())),
    }
    let now = Value::String(Timestamp::now().to_string());

    if kind != "Create" {
        let slug = object
            .id()
            .and_then(|id| id.strip_prefix(&format!("{sender}/activities/")))
            .filter(|slug| !slug.is_empty() && !slug.contains('/'))
            .map(str::to_string)
            .unwrap_or_else(mint_slug);
        let activity = object
            .replace("id", Value::String(format!("{sender}/activities/{slug}")))
            .augment("@context", Value::String(AS_CONTEXT.to_string()))
            .augment("published", now)
            .to_value();
        return Ok(Prepared { slug, activity });
    }

    let create = Create::try_from(object).map_err(|e| ApiError::Validation(e.to_string()))?;
    let note = create
        .get_object()
        .ok_or_else(|| ApiError::Validation("Create must embed its object".into()))?;
    let slug = note
        .id()
        .and_then(|id| status_id_of(id, sender))
        .map(str::to_string)
        .unwrap_or_else(mint_slug);
    let note_id = format!("{sender}/status/{slug}");
    let mut note = note
        .replace("id", Value::String(note_id.clone()))
        .replace("attributedTo", Value::String(sender.to_string()))
        .augment("published", now.clone())
        .to_value();
    if let Some(content) = note.get_mut("content") {
        if let Some(html) = content.as_str() {
            *content = Value::String(ammonia::clean(html));
        }
    }
    let activity = Object::from(
        create
            .with_object(note)
            .with_object_addressing()
            .with_actor(sender),
    )
    .replace("id", Value::String(format!("{note_id}/activity")))
    .augment("@context", Value::String(AS_CONTEXT.to_string()))
    .augment("published", now)
    .to_value();
    Ok(Prepared { slug, activity })
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    mailman: Mailman,
}

impl Dispatcher {
    pub(crate) fn new(mailman: Mailman) -> Dispatcher {
        Dispatcher { mailman }
    }

    /// Stores the activity in the sender's outbox, then delivers it to every
    /// recipient inbox. Only local failures are errors; delivery failures are
    /// counted.
    pub(crate) async fn submit(
        &self,
        social: &Social,
        activity: Value,
        sender: &str,
    ) -> ApiResult<Submission> {
        let Prepared { slug, activity } = prepare(activity, sender)?;
        let key = keys::load_from_pod(social.pod(), social.layout(), sender)
            .await
            .map_err(|e| ApiError::Internal(e.context("signing key unavailable")))?;
        if social
            .store(Container::Outbox, &activity, Some(&slug))
            .await
            .is_none()
        {
            return Err(ApiError::Upstream(
                "unable to store the activity in the outbox".into(),
            ));
        }

        let object = Object::from(&activity);
        let id = object.id().unwrap_or_default().to_string();
        let kind = object.get_first_type().unwrap_or_default().to_string();
        let inboxes = self.resolve_inboxes(social, &activity, sender).await;
        let federated = self
            .deliver(inboxes, Arc::new(activity), Arc::new(key))
            .await;
        info!(
            target: "apub",
            %id, total = federated.total, successful = federated.successful,
            failed = federated.failed, "activity federated"
        );
        Ok(Submission {
            id,
            kind,
            federated,
        })
    }

    /// Recipient inboxes of `activity`: `to` and `cc` without the public
    /// collection, the sender's followers collection expanded, each actor
    /// dereferenced. Actors that cannot be dereferenced are skipped.
    pub(crate) async fn resolve_inboxes(
        &self,
        social: &Social,
        activity: &Value,
        sender: &str,
    ) -> Vec<String> {
        let object = Object::from(activity);
        let followers = format!("{sender}/followers");
        let mut recipients: Vec<String> = vec![];
        for iri in object
            .get_str_array("to")
            .into_iter()
            .chain(object.get_str_array("cc"))
        {
            if is_public_iri(iri) || iri == sender {
                continue;
            }
            if iri == followers {
                for follower in social.followers().await {
                    if !recipients.contains(&follower) {
                        recipients.push(follower);
                    }
                }
            } else if !recipients.iter().any(|r| r == iri) {
                recipients.push(iri.to_string());
            }
        }

        let mut lookups = JoinSet::new();
        for recipient in recipients {
            let mailman = self.mailman.clone();
            lookups.spawn(async move {
                let inbox = mailman.resolve_inbox(&recipient).await;
                (recipient, inbox)
            });
        }
        let mut inboxes = BTreeSet::new();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((_, Ok(inbox))) => {
                    inboxes.insert(inbox);
                }
                Ok((recipient, Err(error))) => {
                    warn!(target: "apub", %recipient, error = format!("{error:#}"), "recipient dropped");
                }
                Err(error) => warn!(target: "apub", %error, "recipient lookup aborted"),
            }
        }
        inboxes.into_iter().collect()
    }

    /// Posts to every inbox concurrently and waits for all of them.
    pub(crate) async fn deliver(
        &self,
        inboxes: Vec<String>,
        activity: Arc<Value>,
        key: Arc<SigningKey>,
    ) -> Federation {
        let mut federation = Federation {
            total: inboxes.len(),
            ..Default::default()
        };
        let mut deliveries = JoinSet::new();
        for inbox in inboxes {
            let mailman = self.mailman.clone();
            let activity = activity.clone();
            let key = key.clone();
            deliveries.spawn(async move {
                match mailman.post_signed(&inbox, &activity, &key).await {
                    Ok(status) if status.is_success() => true,
                    Ok(status) => {
                        warn!(target: "apub", %inbox, %status, "delivery failed");
                        false
                    }
                    Err(error) => {
                        warn!(target: "apub", %inbox, error = format!("{error:#}"), "delivery failed");
                        false
                    }
                }
            });
        }
        while let Some(joined) = deliveries.join_next().await {
            if matches!(joined, Ok(true)) {
                federation.successful += 1;
            }
        }
        federation.failed = federation.total - federation.successful;
        federation
    }
}
