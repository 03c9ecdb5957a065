//! An in-process Solid Pod and a wired-up set of services for tests that
//! need stateful read-modify-write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use fjall::Keyspace;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::activity_pub::keys::{self, KeyMaterial, generate_key_material};
use crate::activity_pub::mailman::Mailman;
use crate::activity_pub::model::{Actor, Profile};
use crate::activity_pub::social::Social;
use crate::activity_pub::{ActorLocation, ActorRepo, Directory};
use crate::config::Config;
use crate::session::{FetchCache, IdentityProvider, Session, SessionStore, TokenSet};

/// Hands out the same access token to everyone.
pub(crate) struct StaticProvider;

impl IdentityProvider for StaticProvider {
    async fn refresh(&self, _session: &Session) -> Result<TokenSet> {
        Ok(TokenSet {
            access_token: "test-token".to_string().into(),
            refresh_token: None,
            expires_in: Some(3600),
            id_token: None,
        })
    }
}

pub(crate) struct Fixture {
    _tmp_dir: TempDir,
    pub(crate) pod: FakePod,
    pub(crate) config: Config,
    pub(crate) keyspace: Keyspace,
    pub(crate) directory: Directory,
    pub(crate) actors: ActorRepo,
    pub(crate) sessions: SessionStore,
    pub(crate) cache: Arc<FetchCache<StaticProvider>>,
    pub(crate) mailman: Mailman,
}

impl Fixture {
    pub(crate) async fn new() -> Result<Fixture> {
        let tmp_dir = tempfile::tempdir()?;
        let keyspace = fjall::Config::new(tmp_dir.path()).temporary(true).open()?;
        let mut config = Config::default();
        config.activity_pub.base_url = "https://social.example".to_string();
        config.activity_pub.require_signatures = false;
        let sessions = SessionStore::new(keyspace.clone(), 7 * 24 * 3600, 600)?;
        let mailman = Mailman::new(Duration::from_secs(5))?;
        let cache = FetchCache::new(
            StaticProvider,
            sessions.clone(),
            mailman.client().clone(),
            60,
        );
        Ok(Fixture {
            pod: FakePod::start().await?,
            directory: Directory::new(keyspace.clone())?,
            actors: ActorRepo::new(keyspace.clone())?,
            sessions,
            cache: Arc::new(cache),
            mailman,
            config,
            keyspace,
            _tmp_dir: tmp_dir,
        })
    }

    pub(crate) fn web_id(&self, username: &str) -> String {
        format!("{}{username}/profile/card#me", self.pod.root())
    }

    /// Registers `username` with a provisioned Pod and a key pair.
    pub(crate) async fn register(&self, username: &str) -> Result<ActorLocation> {
        let web_id = self.web_id(username);
        let storage = format!("{}{username}/", self.pod.root());
        self.login(username)?;
        let actor_id = self.config.activity_pub.actor_iri(username);
        self.directory
            .register(&web_id, username, &actor_id, Some(&storage))?;
        let location = self
            .directory
            .lookup(username)?
            .context("registered user not found")?;
        let social =
            Social::for_owner(&*self.cache, &location, &self.config.pod.app_container).await?;
        social.provision(&web_id).await?;
        let material: KeyMaterial = generate_key_material()?;
        keys::store_in_pod(social.pod(), social.layout(), &actor_id, &material).await?;
        let profile = Profile {
            username: username.to_string(),
            ..Default::default()
        };
        self.actors.insert(
            username,
            Actor::local(&self.config.activity_pub, &profile, &material.public_pem),
        )?;
        self.sessions.set_username(&web_id, username)?;
        Ok(location)
    }

    /// Opens a browser session for `username`'s WebID; returns the cookie value.
    pub(crate) fn login(&self, username: &str) -> Result<String> {
        self.sessions.create(Session {
            web_id: self.web_id(username),
            username: None,
            issuer: "https://idp.example".to_string(),
            client_id: "https://social.example/clientid.jsonld".to_string(),
            client_secret: None,
            refresh_token: Some("refresh".to_string()),
            pod_url: Some(format!("{}{username}/", self.pod.root())),
        })
    }

    /// Stores `note` inside a `Create` activity at `outbox/{status_id}`.
    pub(crate) fn seed_note(&self, username: &str, status_id: &str, note: Value) {
        let activity = json!({
            "id": format!("{}/activity", note["id"].as_str().unwrap_or_default()),
            "type": "Create",
            "actor": self.config.activity_pub.actor_iri(username),
            "to": note.get("to").cloned().unwrap_or(json!([])),
            "object": note,
        });
        self.pod
            .put_json(&format!("/{username}/social/outbox/{status_id}"), &activity);
    }

    /// The note stored at `outbox/{status_id}`.
    pub(crate) fn note(&self, username: &str, status_id: &str) -> Value {
        self.pod
            .get_json(&format!("/{username}/social/outbox/{status_id}"))
            .map(|activity| activity["object"].clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct PodState {
    containers: BTreeSet<String>,
    resources: BTreeMap<String, (String, Vec<u8>)>,
}

#[derive(Clone)]
pub(crate) struct FakePod {
    base: String,
    state: Arc<Mutex<PodState>>,
}

impl FakePod {
    pub(crate) async fn start() -> Result<FakePod> {
        let state = Arc::new(Mutex::new(PodState::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let app = Router::new().fallback(handle).with_state(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(FakePod { base, state })
    }

    /// The Pod root, with a trailing slash.
    pub(crate) fn root(&self) -> String {
        format!("{}/", self.base)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub(crate) fn get_json(&self, path: &str) -> Option<Value> {
        let state = self.state.lock().ok()?;
        let (_, body) = state.resources.get(path)?;
        serde_json::from_slice(body).ok()
    }

    pub(crate) fn put_json(&self, path: &str, value: &Value) {
        if let Ok(mut state) = self.state.lock() {
            state.resources.insert(
                path.to_string(),
                ("application/ld+json".to_string(), value.to_string().into_bytes()),
            );
        }
    }

    pub(crate) fn has_container(&self, path: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.containers.contains(path))
            .unwrap_or(false)
    }

    /// Paths of the resources directly inside `container`.
    pub(crate) fn children(&self, container: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|state| children(&state, container))
            .unwrap_or_default()
    }
}

fn children(state: &PodState, container: &str) -> Vec<String> {
    state
        .resources
        .keys()
        .chain(state.containers.iter())
        .filter(|path| !path.ends_with(".acl"))
        .filter(|path| {
            path.strip_prefix(container)
                .is_some_and(|rest| !rest.is_empty() && !rest.trim_end_matches('/').contains('/'))
        })
        .cloned()
        .collect()
}

async fn handle(
    State(state): State<Arc<Mutex<PodState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let Ok(mut state) = state.lock() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    match (method.as_str(), path.ends_with('/')) {
        ("PUT", true) => {
            if state.containers.insert(path) {
                StatusCode::CREATED.into_response()
            } else {
                StatusCode::CONFLICT.into_response()
            }
        }
        ("PUT", false) => {
            let existed = state
                .resources
                .insert(path, (content_type, body.to_vec()))
                .is_some();
            if existed {
                StatusCode::RESET_CONTENT.into_response()
            } else {
                StatusCode::CREATED.into_response()
            }
        }
        ("POST", true) => {
            let location = format!("{path}{}", uuid::Uuid::now_v7().simple());
            state
                .resources
                .insert(location.clone(), (content_type, body.to_vec()));
            (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
        }
        ("GET", true) => {
            if !state.containers.contains(&path) {
                return StatusCode::NOT_FOUND.into_response();
            }
            let contains: Vec<Value> = children(&state, &path)
                .into_iter()
                .map(|child| json!({"@id": child}))
                .collect();
            let listing = json!({"@id": path, "ldp:contains": contains});
            (
                [(header::CONTENT_TYPE, "application/ld+json")],
                listing.to_string(),
            )
                .into_response()
        }
        ("GET", false) => match state.resources.get(&path) {
            Some((content_type, body)) => {
                ([(header::CONTENT_TYPE, content_type.clone())], body.clone()).into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        },
        ("DELETE", _) => {
            if state.resources.remove(&path).is_some() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
