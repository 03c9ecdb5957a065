mod actors;
mod auth;
mod content_type;
mod federation;

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::activity_pub::mailman::Mailman;
use crate::activity_pub::social::Social;
use crate::activity_pub::{ActorLocation, ActorRepo, Directory};
use crate::config::{Config, RuntimeConfig};
use crate::error::{ApiError, ApiResult};
use crate::pod::PodLayout;
use crate::session::{FetchCache, IdentityProvider, OidcProvider, SessionStore};

pub(crate) use auth::Viewer;

/// Everything a request handler may need, shared by all requests.
pub(crate) struct Services<P> {
    pub(crate) config: Config,
    pub(crate) directory: Directory,
    pub(crate) actors: ActorRepo,
    pub(crate) sessions: SessionStore,
    pub(crate) cache: Arc<FetchCache<P>>,
    pub(crate) oidc: OidcProvider,
    pub(crate) mailman: Mailman,
    /// Held for the whole of a registration, Pod writes included.
    pub(crate) registration: Mutex<()>,
}

pub(crate) struct AppState<P>(Arc<Services<P>>);

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        AppState(self.0.clone())
    }
}

impl<P> Deref for AppState<P> {
    type Target = Services<P>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P> AppState<P> {
    pub(crate) fn new(services: Services<P>) -> AppState<P> {
        AppState(Arc::new(services))
    }
}

impl<P: IdentityProvider> AppState<P> {
    /// The registered user behind `username`, or 404.
    pub(crate) fn locate(&self, username: &str) -> ApiResult<ActorLocation> {
        self.directory
            .lookup(&username.to_lowercase())?
            .ok_or_else(|| ApiError::NotFound("Actor not found".to_string()))
    }

    /// Opens the owner's Pod with their credentials for writes.
    pub(crate) async fn owner_pod(&self, owner: &ActorLocation) -> ApiResult<Social> {
        Social::for_owner(&*self.cache, owner, &self.config.pod.app_container)
            .await
            .map_err(|error| {
                warn!(target: "http", web_id = %owner.web_id, error = format!("{error:#}"), "pod unavailable");
                ApiError::Upstream("unable to access the user's pod".to_string())
            })
    }

    /// Opens the owner's Pod for reads, anonymously when their credentials
    /// cannot be refreshed.
    pub(crate) async fn reader_pod(&self, owner: &ActorLocation) -> Social {
        match Social::for_owner(&*self.cache, owner, &self.config.pod.app_container).await {
            Ok(social) => social,
            Err(error) => {
                warn!(target: "http", web_id = %owner.web_id, error = format!("{error:#}"), "reading pod anonymously");
                Social::new(
                    self.cache.anonymous(),
                    PodLayout::new(&owner.pod_url, &self.config.pod.app_container),
                )
            }
        }
    }
}

pub(crate) fn router<P: IdentityProvider>(state: AppState<P>) -> Router {
    Router::new()
        .route("/.well-known/webfinger", get(actors::webfinger::<P>))
        .route("/clientid.jsonld", get(auth::client_id_document::<P>))
        .route("/auth/login", get(auth::login::<P>))
        .route("/auth/callback", get(auth::callback::<P>))
        .route("/auth/logout", post(auth::logout::<P>))
        .route("/api/register", post(actors::register::<P>))
        .route("/actors/{username}", get(actors::actor_document::<P>))
        .route(
            "/actors/{username}/inbox",
            get(federation::list_inbox::<P>).post(federation::receive::<P>),
        )
        .route(
            "/actors/{username}/outbox",
            get(federation::list_outbox::<P>).post(federation::submit::<P>),
        )
        .route("/actors/{username}/followers", get(actors::followers::<P>))
        .route("/actors/{username}/following", get(actors::following::<P>))
        .route("/actors/{username}/status/{id}", get(actors::status::<P>))
        .route("/actors/{username}/statuses/{id}", get(actors::status::<P>))
        .route(
            "/actors/{username}/status/{id}/activity",
            get(actors::status_activity::<P>),
        )
        .route(
            "/actors/{username}/activities/{id}",
            get(actors::activity::<P>),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::resolve_viewer::<P>,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) async fn serve(config: &RuntimeConfig) -> Result<()> {
    let init = &config.init;
    let directory = Directory::new(config.keyspace.clone())?;
    let actors = ActorRepo::new(config.keyspace.clone())?;
    let sessions = SessionStore::new(
        config.keyspace.clone(),
        init.session.max_age_days * 24 * 3600,
        init.session.pending_max_age_secs,
    )?;
    let mailman = Mailman::new(Duration::from_secs(init.federation.timeout_secs))?;
    let oidc = OidcProvider::new(mailman.client().clone(), init.oidc.clone());
    let cache = FetchCache::new(
        oidc.clone(),
        sessions.clone(),
        mailman.client().clone(),
        init.session.refresh_skew_secs,
    );
    tokio::spawn(purge_pending(sessions.clone()));

    let state = AppState::new(Services {
        config: init.clone(),
        directory,
        actors,
        sessions,
        cache: Arc::new(cache),
        oidc,
        mailman,
        registration: Mutex::new(()),
    });
    let app = router(state);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", init.server.http_port)).await?;
    info!(target: "lifecycle", port = init.server.http_port, base_url = %init.activity_pub.base_url, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Removes login attempts that never came back from the identity provider.
async fn purge_pending(sessions: SessionStore) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        match sessions.purge_pending() {
            Ok(0) => {}
            Ok(purged) => info!(target: "session", purged, "expired pending sessions removed"),
            Err(error) => warn!(target: "session", error = format!("{error:#}"), "purging pending sessions failed"),
        }
    }
}

async fn shutdown_signal() {
    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!(target: "lifecycle", "unable to install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "lifecycle", "Received the terminate signal; stopping");
        }
        _ = sigint.recv() => {
            info!(target: "lifecycle", "Received the interrupt signal; stopping");
        }
    }
}
