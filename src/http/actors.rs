use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::content_type::ActivityStreamsJson;
use super::federation::PageQuery;
use super::{AppState, Viewer};
use crate::activity_pub::keys::{self, generate_key_material};
use crate::activity_pub::model::{Actor, Object, Profile, render_collection};
use crate::activity_pub::social::Social;
use crate::activity_pub::{DirectoryError, normalize_username};
use crate::error::{ApiError, ApiResult};
use crate::pod::{Container, PodLayout, pod_url_from_web_id};
use crate::session::IdentityProvider;

#[derive(Deserialize)]
pub(super) struct WebfingerQuery {
    resource: Option<String>,
}

/// Resolves `acct:user@domain` or an actor IRI to the actor.
pub(super) async fn webfinger<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Query(query): Query<WebfingerQuery>,
) -> ApiResult<impl IntoResponse> {
    let resource = query
        .resource
        .ok_or_else(|| ApiError::Validation("resource is required".to_string()))?;
    let config = &state.config.activity_pub;
    let actors_prefix = format!("{}/actors/", config.base_url);
    let username = if let Some(acct) = resource.strip_prefix("acct:") {
        let (user, domain) = acct
            .split_once('@')
            .ok_or_else(|| ApiError::Validation("malformed acct resource".to_string()))?;
        if !domain.eq_ignore_ascii_case(config.domain()) {
            return Err(ApiError::NotFound("unknown domain".to_string()));
        }
        user.to_string()
    } else if let Some(user) = resource.strip_prefix(&actors_prefix) {
        user.to_string()
    } else {
        return Err(ApiError::NotFound("unknown resource".to_string()));
    };
    let mapping = state
        .directory
        .find_by_username(&username)?
        .ok_or_else(|| ApiError::NotFound("Actor not found".to_string()))?;
    let jrd = json!({
        "subject": format!("acct:{}@{}", mapping.username, config.domain()),
        "aliases": [mapping.actor_id],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": mapping.actor_id,
            },
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": mapping.actor_id,
            }
        ]
    });
    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], Json(jrd)))
}

pub(super) async fn actor_document<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Path(username): Path<String>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    match state.actors.find_one(&username.to_lowercase())? {
        Some(actor) => Ok(ActivityStreamsJson(actor.into())),
        None => Err(ApiError::NotFound("Actor not found".to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RegisterRequest {
    username: String,
    name: Option<String>,
    summary: Option<String>,
    /// Pod root to use instead of the one derived from the WebID.
    storage: Option<String>,
}

/// Creates the actor of the logged-in WebID.
pub(super) async fn register<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, ActivityStreamsJson<Value>)> {
    let session = viewer.session()?;
    let web_id = session.web_id.as_str();
    let username = normalize_username(&request.username)?;
    let _registering = state.registration.lock().await;

    if let Some(mapping) = state.directory.find_by_web_id(web_id)? {
        let actor = state
            .actors
            .find_one(&mapping.username)?
            .ok_or_else(|| ApiError::NotFound("Actor not found".to_string()))?;
        return Ok((StatusCode::OK, ActivityStreamsJson(actor.into())));
    }
    if state.directory.find_by_username(&username)?.is_some() {
        return Err(DirectoryError::UsernameTaken.into());
    }
    let pod_url = request
        .storage
        .clone()
        .filter(|storage| storage.starts_with("http"))
        .or_else(|| session.pod_url.clone())
        .or_else(|| pod_url_from_web_id(web_id))
        .ok_or_else(|| ApiError::Validation("unable to determine the pod".to_string()))?;

    let upstream = |what: &'static str| {
        move |error: anyhow::Error| {
            warn!(target: "http", %web_id, error = format!("{error:#}"), "unable to {what}");
            ApiError::Upstream(format!("unable to {what}"))
        }
    };
    let pod = state
        .cache
        .pod_client(web_id)
        .await
        .map_err(upstream("access the pod"))?;
    let social = Social::new(pod, PodLayout::new(&pod_url, &state.config.pod.app_container));
    social
        .provision(web_id)
        .await
        .map_err(upstream("create the pod containers"))?;
    let actor_id = state.config.activity_pub.actor_iri(&username);
    let material = generate_key_material()?;
    keys::store_in_pod(social.pod(), social.layout(), &actor_id, &material)
        .await
        .map_err(upstream("store the key pair"))?;

    let profile = Profile {
        username: username.clone(),
        name: request.name,
        summary: request.summary.map(|summary| ammonia::clean(&summary)),
        icon: None,
    };
    let actor = Actor::local(&state.config.activity_pub, &profile, &material.public_pem);
    let document = Value::from(actor.clone());
    social
        .pod()
        .put_json(&social.layout().actor_document(), &document)
        .await
        .map_err(upstream("store the actor document"))?;

    if let Err(error) = state
        .directory
        .register(web_id, &username, &actor_id, Some(&pod_url))
    {
        // The directory refused the mapping; the pod copies belong to nobody.
        for url in [social.layout().actor_document(), social.layout().keys()] {
            social.pod().delete_resource(&url).await;
        }
        return Err(error.into());
    }
    state.actors.insert(&username, actor)?;
    state.sessions.set_username(web_id, &username)?;
    state.sessions.set_pod_url(web_id, &pod_url)?;
    info!(target: "http", %web_id, %username, "registration complete");
    Ok((StatusCode::CREATED, ActivityStreamsJson(document)))
}

async fn list_collection<P: IdentityProvider>(
    state: &AppState<P>,
    username: &str,
    query: &PageQuery,
    name: &str,
) -> ApiResult<Value> {
    let page = query.page()?;
    let owner = state.locate(username)?;
    let social = state.reader_pod(&owner).await;
    let members = match name {
        "followers" => social.followers().await,
        _ => social.following().await,
    };
    Ok(render_collection(
        &format!("{}/{name}", owner.actor_id),
        members.into_iter().map(Value::String).collect(),
        page,
        state.config.activity_pub.page_size,
    ))
}

pub(super) async fn followers<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let collection = list_collection(&state, &username, &query, "followers").await?;
    Ok(ActivityStreamsJson(collection))
}

pub(super) async fn following<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let collection = list_collection(&state, &username, &query, "following").await?;
    Ok(ActivityStreamsJson(collection))
}

/// Public objects are readable by anyone. Others only by their owner and by
/// the WebIDs they are addressed to.
fn authorize_read(viewer: &Viewer, username: &str, object: &Object<'_>) -> ApiResult<()> {
    if object.is_public() || viewer.is_owner(username) {
        return Ok(());
    }
    let web_id = viewer.web_id().ok_or(ApiError::AuthRequired)?;
    if object.is_addressed_to(web_id) {
        return Ok(());
    }
    Err(ApiError::Forbidden("not addressed to you".to_string()))
}

pub(super) async fn status<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path((username, status_id)): Path<(String, String)>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let username = username.to_lowercase();
    let owner = state.locate(&username)?;
    let social = state.reader_pod(&owner).await;
    let stored = social
        .load_note(&status_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Status not found".to_string()))?;
    let note = Value::from(stored.note);
    authorize_read(&viewer, &username, &Object::from(&note))?;
    Ok(ActivityStreamsJson(note))
}

/// The `Create` activity wrapping a status.
pub(super) async fn status_activity<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path((username, status_id)): Path<(String, String)>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let username = username.to_lowercase();
    let owner = state.locate(&username)?;
    let social = state.reader_pod(&owner).await;
    let activity = social
        .read(Container::Outbox, &status_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Activity not found".to_string()))?;
    authorize_read(&viewer, &username, &Object::from(&activity))?;
    Ok(ActivityStreamsJson(activity))
}

pub(super) async fn activity<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    Path((username, activity_id)): Path<(String, String)>,
) -> ApiResult<ActivityStreamsJson<Value>> {
    let username = username.to_lowercase();
    let owner = state.locate(&username)?;
    let social = state.reader_pod(&owner).await;
    let activity = match social.read(Container::Outbox, &activity_id).await {
        Some(activity) => activity,
        None => social
            .read(Container::Activities, &activity_id)
            .await
            .ok_or_else(|| ApiError::NotFound("Activity not found".to_string()))?,
    };
    authorize_read(&viewer, &username, &Object::from(&activity))?;
    Ok(ActivityStreamsJson(activity))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::json;

    use crate::http::tests::{app, cookie, json_body, send};
    use crate::testing::Fixture;

    fn register_request(session: Option<String>, body: serde_json::Value) -> Result<Request<Body>> {
        let mut builder = Request::post("/api/register").header(header::CONTENT_TYPE, "application/json");
        if let Some(session) = session {
            builder = builder.header(header::COOKIE, session);
        }
        Ok(builder.body(Body::from(body.to_string()))?)
    }

    #[tokio::test]
    async fn registration_provisions_the_pod() -> Result<()> {
        let fixture = Fixture::new().await?;
        let app = app(&fixture);

        let response = send(&app, register_request(None, json!({"username": "carol"}))?).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let session = cookie(&fixture, &fixture.login("carol")?);
        let response = send(
            &app,
            register_request(Some(session.clone()), json!({"username": "Carol", "name": "Carol C"}))?,
        )
        .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
        let actor = json_body(response).await?;
        assert_eq!(actor["id"], "https://social.example/actors/carol");
        assert_eq!(actor["name"], "Carol C");
        assert!(actor["publicKey"]["publicKeyPem"].as_str().is_some_and(|pem| pem.contains("PUBLIC KEY")));

        assert!(fixture.pod.has_container("/carol/social/inbox/"));
        assert!(fixture.pod.get_json("/carol/social/settings/keys").is_some());
        assert_eq!(
            fixture.pod.get_json("/carol/social/profile/actor").map(|doc| doc["id"].clone()),
            Some(json!("https://social.example/actors/carol"))
        );
        let stored = fixture.sessions.find_by_web_id(&fixture.web_id("carol"))?;
        assert_eq!(stored.and_then(|s| s.username).as_deref(), Some("carol"));

        // Same WebID again: the existing actor comes back.
        let response = send(&app, register_request(Some(session), json!({"username": "other"}))?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?["id"], "https://social.example/actors/carol");

        let response = send(&app, Request::get("/actors/carol").body(Body::empty())?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registrations_of_one_web_id() -> Result<()> {
        let fixture = Fixture::new().await?;
        let app = app(&fixture);
        let session = cookie(&fixture, &fixture.login("carol")?);

        let carol = register_request(Some(session.clone()), json!({"username": "carol"}))?;
        let carla = register_request(Some(session), json!({"username": "carla"}))?;
        let (first, second) = tokio::join!(send(&app, carol), send(&app, carla));
        let (first, second) = (first?, second?);
        let mut statuses = [first.status(), second.status()];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::OK, StatusCode::CREATED]);
        let (first, second) = (json_body(first).await?, json_body(second).await?);
        assert_eq!(first["id"], second["id"]);

        let winner = fixture
            .directory
            .find_by_web_id(&fixture.web_id("carol"))?
            .map(|mapping| mapping.username);
        let loser = if winner.as_deref() == Some("carol") { "carla" } else { "carol" };
        assert!(fixture.actors.find_one(loser)?.is_none());
        assert!(fixture.directory.find_by_username(loser)?.is_none());
        let stored = fixture.sessions.find_by_web_id(&fixture.web_id("carol"))?;
        assert_eq!(stored.and_then(|s| s.username), winner);

        // The published key still matches the private key in the Pod.
        let keys = fixture.pod.get_json("/carol/social/settings/keys").unwrap_or_default();
        assert_eq!(keys["publicKeyPem"], first["publicKey"]["publicKeyPem"]);
        Ok(())
    }

    #[tokio::test]
    async fn username_conflicts() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.register("alice").await?;
        let app = app(&fixture);
        let session = cookie(&fixture, &fixture.login("mallory")?);

        let response = send(&app, register_request(Some(session.clone()), json!({"username": "alice"}))?).await?;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await?["message"], "Username already taken");

        let response = send(&app, register_request(Some(session), json!({"username": "no spaces"}))?).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn webfinger_resolves_accounts() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.register("alice").await?;
        let app = app(&fixture);

        for resource in ["acct:alice@social.example", "https://social.example/actors/alice"] {
            let response = send(
                &app,
                Request::get(format!("/.well-known/webfinger?resource={resource}")).body(Body::empty())?,
            )
            .await?;
            assert_eq!(response.status(), StatusCode::OK, "{resource}");
            let jrd = json_body(response).await?;
            assert_eq!(jrd["subject"], "acct:alice@social.example");
            assert_eq!(jrd["links"][0]["href"], "https://social.example/actors/alice");
        }

        let response = send(
            &app,
            Request::get("/.well-known/webfinger?resource=acct:alice@elsewhere.example").body(Body::empty())?,
        )
        .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn status_visibility() -> Result<()> {
        let fixture = Fixture::new().await?;
        fixture.register("alice").await?;
        let actor = fixture.config.activity_pub.actor_iri("alice");
        let carol = fixture.web_id("carol");
        fixture.seed_note(
            "alice",
            "public",
            json!({"id": format!("{actor}/status/public"), "type": "Note", "content": "hi",
                   "to": ["https://www.w3.org/ns/activitystreams#Public"]}),
        );
        fixture.seed_note(
            "alice",
            "direct",
            json!({"id": format!("{actor}/status/direct"), "type": "Note", "content": "psst", "to": [carol]}),
        );
        let app = app(&fixture);
        let get = |uri: &str, session: Option<String>| -> Result<Request<Body>> {
            let mut builder = Request::get(uri);
            if let Some(session) = session {
                builder = builder.header(header::COOKIE, session);
            }
            Ok(builder.body(Body::empty())?)
        };

        let response = send(&app, get("/actors/alice/status/public", None)?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?["content"], "hi");
        let response = send(&app, get("/actors/alice/statuses/public", None)?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, get("/actors/alice/status/direct", None)?).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let dave = cookie(&fixture, &fixture.login("dave")?);
        let response = send(&app, get("/actors/alice/status/direct", Some(dave))?).await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let carol_session = cookie(&fixture, &fixture.login("carol")?);
        let response = send(&app, get("/actors/alice/status/direct", Some(carol_session))?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, get("/actors/alice/status/missing", None)?).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, get("/actors/alice/status/public/activity", None)?).await?;
        assert_eq!(json_body(response).await?["type"], "Create");
        Ok(())
    }

    #[tokio::test]
    async fn followers_are_paginated() -> Result<()> {
        let mut fixture = Fixture::new().await?;
        fixture.config.activity_pub.page_size = 2;
        fixture.register("alice").await?;
        fixture.pod.put_json(
            "/alice/social/followers/list",
            &json!({"orderedItems": ["https://a/1", "https://a/2", "https://a/3"]}),
        );
        let app = app(&fixture);

        let collection = json_body(send(&app, Request::get("/actors/alice/followers").body(Body::empty())?).await?).await?;
        assert_eq!(collection["totalItems"], 3);
        assert_eq!(collection["first"], "https://social.example/actors/alice/followers?page=1");

        let page = json_body(send(&app, Request::get("/actors/alice/followers?page=2").body(Body::empty())?).await?).await?;
        assert_eq!(page["orderedItems"], json!(["https://a/3"]));
        assert_eq!(page["prev"], "https://social.example/actors/alice/followers?page=1");
        assert!(page.get("next").is_none());

        let response = send(&app, Request::get("/actors/alice/following?page=abc").body(Body::empty())?).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }
}
