use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::content_type::{ActivityStreamsJson, is_activity_json};
use super::{AppState, Viewer};
use crate::activity_pub::hs2019::verify;
use crate::activity_pub::inbox::InboxProcessor;
use crate::activity_pub::model::{Object, parse_page, render_collection};
use crate::activity_pub::outbox::{Dispatcher, Submission};
use crate::error::{ApiError, ApiResult};
use crate::pod::Container;
use crate::session::IdentityProvider;

const MAX_ACTIVITY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub(super) struct PageQuery {
    page: Option<String>,
}

impl PageQuery {
    pub(super) fn page(&self) -> ApiResult<Option<usize>> {
        Ok(self.page.as_deref().map(parse_page).transpose()?)
    }
}

/// Server-to-server delivery into a local user's inbox.
///
/// Anything well-formed is accepted; what processing made of it is only
/// logged.
pub(super) async fn receive<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Path(username): Path<String>,
    request: Request,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let username = username.to_lowercase();
    let owner = state.locate(&username)?;
    let (parts, body) = request.into_parts();
    if !is_activity_json(&parts.headers) {
        return Err(ApiError::Validation(
            "content type must be application/activity+json or application/ld+json".to_string(),
        ));
    }
    let body = axum::body::to_bytes(body, MAX_ACTIVITY_BYTES)
        .await
        .map_err(|_| ApiError::Validation("unreadable request body".to_string()))?;
    let activity: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("request body is not JSON".to_string()))?;
    let object = Object::from(&activity);
    let (Some(kind), Some(actor)) = (object.get_first_type(), object.get_node_iri("actor")) else {
        return Err(ApiError::Validation(
            "activity must have a type and an actor".to_string(),
        ));
    };
    if state.actors.find_one(&username)?.is_none() {
        return Err(ApiError::Validation("actor profile is missing".to_string()));
    }

    let verification = verify(&parts, &body, &state.mailman).await;
    if state.config.activity_pub.require_signatures
        && (!verification.verified || verification.actor_id.as_deref() != Some(actor))
    {
        info!(target: "apub", %actor, owner = %owner.actor_id, "unauthenticated delivery rejected");
        return Err(ApiError::AuthRequired);
    }

    let processor = InboxProcessor {
        config: &state.config,
        directory: &state.directory,
        cache: &state.cache,
        mailman: &state.mailman,
    };
    let outcome = processor.process(&owner, &activity).await;
    debug!(target: "apub", %kind, %actor, ?outcome, signed = verification.verified, "inbox activity processed");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": format!("{kind} activity accepted"),
        })),
    ))
}

pub(super) async fn list_inbox<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let username = username.to_lowercase();
    let page = query.page()?;
    let owner = state.locate(&username)?;
    viewer.require_owner(&username)?;
    let social = state.owner_pod(&owner).await?;
    let items = social.list(Container::Inbox).await;
    Ok(ActivityStreamsJson(render_collection(
        &format!("{}/inbox", owner.actor_id),
        items,
        page,
        state.config.activity_pub.page_size,
    )))
}

/// The outbox; others than the owner only see public activities.
pub(super) async fn list_outbox<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let username = username.to_lowercase();
    let page = query.page()?;
    let owner = state.locate(&username)?;
    let social = state.reader_pod(&owner).await;
    let mut items = social.list(Container::Outbox).await;
    if !viewer.is_owner(&username) {
        items.retain(|item| Object::from(item).is_public());
    }
    Ok(ActivityStreamsJson(render_collection(
        &format!("{}/outbox", owner.actor_id),
        items,
        page,
        state.config.activity_pub.page_size,
    )))
}

/// Client-to-server posting: store in the outbox, then federate.
pub(super) async fn submit<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path(username): Path<String>,
    Json(activity): Json<Value>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let username = username.to_lowercase();
    viewer.require_owner(&username)?;
    let owner = state.locate(&username)?;
    let social = state.owner_pod(&owner).await?;
    let submission = Dispatcher::new(state.mailman.clone())
        .submit(&social, activity, &owner.actor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(submission)))
}
