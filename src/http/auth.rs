//! Browser sessions: the session cookie gate and the Solid-OIDC login flow.

use anyhow::Context;
use axum::extract::{Query, Request, State};
use axum::{Extension, Json};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use jiff::Timestamp;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::AppState;
use crate::activity_pub::Mapping;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::pod::pod_url_from_web_id;
use crate::session::{
    IdentityProvider, PendingSession, Session, pkce, random_token, web_id_from_id_token,
};

/// Who is making the request, as far as the session cookie tells.
#[derive(Debug, Clone, Default)]
pub(crate) enum Viewer {
    #[default]
    Anonymous,
    /// A logged-in WebID; `session.username` is unset until it registers.
    Session {
        session_id: String,
        session: Session,
    },
}

impl Viewer {
    pub(crate) fn session(&self) -> ApiResult<&Session> {
        match self {
            Viewer::Anonymous => Err(ApiError::AuthRequired),
            Viewer::Session { session, .. } => Ok(session),
        }
    }
    pub(crate) fn web_id(&self) -> Option<&str> {
        self.session().ok().map(|session| session.web_id.as_str())
    }
    pub(crate) fn is_owner(&self, username: &str) -> bool {
        self.session()
            .is_ok_and(|session| session.username.as_deref() == Some(username))
    }
    pub(crate) fn require_owner(&self, username: &str) -> ApiResult<()> {
        self.session()?;
        if !self.is_owner(username) {
            return Err(ApiError::Forbidden(
                "not allowed to act for this actor".to_string(),
            ));
        }
        Ok(())
    }
}

fn pending_cookie_name(config: &Config) -> String {
    format!("{}_pending", config.session.cookie_name)
}

fn client_id(config: &Config) -> String {
    format!("{}/clientid.jsonld", config.activity_pub.base_url)
}

fn redirect_uri(config: &Config) -> String {
    format!("{}/auth/callback", config.activity_pub.base_url)
}

fn session_cookie(name: &str, value: &str, max_age_secs: i64) -> ApiResult<Cookie<'static>> {
    let cookie = Cookie::parse(format!(
        "{name}={value}; Max-Age={max_age_secs}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .context("invalid session cookie")?;
    Ok(cookie)
}

fn removal_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_string(), "")).path("/").into()
}

/// Resolves the session cookie into a [`Viewer`] request extension.
///
/// A cookie that does not lead to a well-formed session is cleared and the
/// request proceeds anonymously. Token refresh is left to the fetch cache.
pub(super) async fn resolve_viewer<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let name = state.config.session.cookie_name.clone();
    let Some(session_id) = jar.get(&name).map(|cookie| cookie.value().to_string()) else {
        request.extensions_mut().insert(Viewer::Anonymous);
        return next.run(request).await;
    };
    let session = match state.sessions.get(&session_id) {
        Ok(Some(session)) if !session.web_id.is_empty() => Some(session),
        Ok(Some(_)) => {
            warn!(target: "session", "malformed session record");
            None
        }
        Ok(None) => None,
        Err(error) => {
            warn!(target: "session", error = format!("{error:#}"), "session lookup failed");
            None
        }
    };
    if let Some(session) = session {
        request
            .extensions_mut()
            .insert(Viewer::Session { session_id, session });
        return next.run(request).await;
    }

    request.extensions_mut().insert(Viewer::Anonymous);
    let response = next.run(request).await;
    let prefix = format!("{name}=");
    let replaced = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .any(|value| value.to_str().is_ok_and(|value| value.starts_with(&prefix)));
    if replaced {
        return response;
    }
    (jar.remove(removal_cookie(&name)), response).into_response()
}

/// The Solid-OIDC client identifier document.
pub(super) async fn client_id_document<P: IdentityProvider>(
    State(state): State<AppState<P>>,
) -> impl IntoResponse {
    let config = &state.config;
    let document: Value = json!({
        "@context": ["https://www.w3.org/ns/solid/oidc-context.jsonld"],
        "client_id": client_id(config),
        "client_name": config.oidc.client_name,
        "redirect_uris": [redirect_uri(config)],
        "post_logout_redirect_uris": [format!("{}/", config.activity_pub.base_url)],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "scope": config.oidc.scope,
        "token_endpoint_auth_method": "none",
        "application_type": "web",
    });
    ([(header::CONTENT_TYPE, "application/ld+json")], Json(document))
}

#[derive(Deserialize)]
pub(super) struct LoginQuery {
    issuer: Option<String>,
}

pub(super) async fn login<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
) -> ApiResult<(CookieJar, Redirect)> {
    let issuer = query
        .issuer
        .filter(|issuer| issuer.starts_with("http"))
        .ok_or_else(|| ApiError::Validation("issuer is required".to_string()))?;
    let metadata = state.oidc.discover(&issuer).await.map_err(|error| {
        warn!(target: "session", %issuer, error = format!("{error:#}"), "discovery failed");
        ApiError::Upstream("identity provider unavailable".to_string())
    })?;

    let pkce = pkce()?;
    let login_state = random_token()?;
    let cookie_session_id = random_token()?;
    let config = &state.config;
    let url = state.oidc.authorization_url(
        &metadata,
        &client_id(config),
        &redirect_uri(config),
        &login_state,
        &pkce.challenge,
    )?;
    state.sessions.put_pending(
        &login_state,
        &PendingSession {
            cookie_session_id: cookie_session_id.clone(),
            issuer,
            code_verifier: pkce.verifier,
            created_at: Timestamp::now().as_second(),
        },
    )?;
    let cookie = session_cookie(
        &pending_cookie_name(config),
        &cookie_session_id,
        config.session.pending_max_age_secs,
    )?;
    Ok((jar.add(cookie), Redirect::to(&url)))
}

#[derive(Deserialize)]
pub(super) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub(super) async fn callback<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<(CookieJar, Redirect)> {
    if let Some(error) = query.error {
        return Err(ApiError::Validation(format!("login failed: {error}")));
    }
    let (Some(code), Some(login_state)) = (query.code, query.state) else {
        return Err(ApiError::Validation("code and state are required".to_string()));
    };
    let config = &state.config;
    let pending_name = pending_cookie_name(config);
    let pending = state
        .sessions
        .take_pending(&login_state)?
        .ok_or_else(|| ApiError::Validation("login expired, please try again".to_string()))?;
    if jar.get(&pending_name).map(|cookie| cookie.value()) != Some(pending.cookie_session_id.as_str()) {
        return Err(ApiError::Forbidden("login was started elsewhere".to_string()));
    }

    let client_id = client_id(config);
    let tokens = state
        .oidc
        .exchange_code(
            &pending.issuer,
            &client_id,
            &code,
            &redirect_uri(config),
            &pending.code_verifier,
        )
        .await
        .map_err(|error| {
            warn!(target: "session", error = format!("{error:#}"), "code exchange failed");
            ApiError::Upstream("identity provider rejected the login".to_string())
        })?;
    let web_id = tokens
        .id_token
        .as_deref()
        .ok_or_else(|| ApiError::Upstream("identity provider returned no id token".to_string()))
        .and_then(|id_token| {
            web_id_from_id_token(id_token)
                .map_err(|error| ApiError::Upstream(format!("{error:#}")))
        })?;

    let mapping = state.directory.find_by_web_id(&web_id)?;
    let pod_url = mapping
        .as_ref()
        .and_then(Mapping::pod_url)
        .or_else(|| pod_url_from_web_id(&web_id));
    let session_id = state.sessions.create(Session {
        web_id: web_id.clone(),
        username: mapping.map(|mapping| mapping.username),
        issuer: pending.issuer,
        client_id,
        client_secret: None,
        refresh_token: tokens.refresh_token.clone(),
        pod_url,
    })?;
    state.cache.seed(&web_id, &tokens).await;
    info!(target: "session", %web_id, "logged in");

    let cookie = session_cookie(
        &config.session.cookie_name,
        &session_id,
        config.session.max_age_days * 24 * 3600,
    )?;
    let jar = jar.remove(removal_cookie(&pending_name)).add(cookie);
    Ok((jar, Redirect::to("/")))
}

pub(super) async fn logout<P: IdentityProvider>(
    State(state): State<AppState<P>>,
    Extension(viewer): Extension<Viewer>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, StatusCode)> {
    if let Viewer::Session { session_id, .. } = &viewer {
        if let Some(web_id) = state.sessions.delete(session_id)? {
            state.cache.evict(&web_id).await;
            info!(target: "session", %web_id, "logged out");
        }
    }
    let jar = jar.remove(removal_cookie(&state.config.session.cookie_name));
    Ok((jar, StatusCode::NO_CONTENT))
}
