//! Solid-OIDC against the user's identity provider: authorization code with
//! PKCE for login, refresh tokens for everything after.

use std::future::Future;

use anyhow::{Context, Result, anyhow, bail};
use base64ct::{Base64UrlUnpadded, Encoding};
use reqwest::{Client, Url};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Session, random_token};
use crate::config::OidcConfig;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProviderMetadata {
    pub(crate) authorization_endpoint: String,
    pub(crate) token_endpoint: String,
}

#[derive(Deserialize)]
pub(crate) struct TokenSet {
    pub(crate) access_token: SecretString,
    pub(crate) refresh_token: Option<String>,
    pub(crate) expires_in: Option<i64>,
    pub(crate) id_token: Option<String>,
}

/// Turns stored credentials into fresh access tokens.
pub(crate) trait IdentityProvider: Send + Sync + 'static {
    fn refresh(&self, session: &Session) -> impl Future<Output = Result<TokenSet>> + Send;
}

pub(crate) struct Pkce {
    pub(crate) verifier: String,
    pub(crate) challenge: String,
}

pub(crate) fn pkce() -> Result<Pkce> {
    let verifier = random_token()?;
    let challenge = Base64UrlUnpadded::encode_string(&Sha256::digest(verifier.as_bytes()));
    Ok(Pkce {
        verifier,
        challenge,
    })
}

/// Reads the `webid` claim (or `sub`) of an ID token.
///
/// The token comes straight from the token endpoint over TLS, so the
/// signature is not checked here.
pub(crate) fn web_id_from_id_token(id_token: &str) -> Result<String> {
    let payload = id_token
        .split('.')
        .nth(1)
        .context("id token is not a JWT")?;
    let bytes = Base64UrlUnpadded::decode_vec(payload.trim_end_matches('='))
        .map_err(|e| anyhow!("invalid id token encoding: {e}"))?;
    let claims: Value = serde_json::from_slice(&bytes).context("invalid id token claims")?;
    claims
        .get("webid")
        .or_else(|| claims.get("sub"))
        .and_then(Value::as_str)
        .filter(|id| id.starts_with("http"))
        .map(str::to_string)
        .context("id token carries no webid")
}

#[derive(Clone)]
pub(crate) struct OidcProvider {
    client: Client,
    config: OidcConfig,
}

impl OidcProvider {
    pub(crate) fn new(client: Client, config: OidcConfig) -> OidcProvider {
        OidcProvider { client, config }
    }

    pub(crate) async fn discover(&self, issuer: &str) -> Result<ProviderMetadata> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            bail!("discovery at {url} failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    pub(crate) fn authorization_url(
        &self,
        metadata: &ProviderMetadata,
        client_id: &str,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> Result<String> {
        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "consent");
        Ok(url.into())
    }

    async fn token_request(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: Option<&str>,
        form: &[(&str, &str)],
    ) -> Result<TokenSet> {
        let mut request = self.client.post(token_endpoint);
        let mut params = form.to_vec();
        match client_secret {
            Some(secret) => request = request.basic_auth(client_id, Some(secret)),
            None => params.push(("client_id", client_id)),
        }
        let response = request.form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("token request failed with {status} {text}");
        }
        Ok(response.json().await?)
    }

    pub(crate) async fn exchange_code(
        &self,
        issuer: &str,
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet> {
        let metadata = self.discover(issuer).await?;
        self.token_request(
            &metadata.token_endpoint,
            client_id,
            None,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", code_verifier),
            ],
        )
        .await
    }
}

impl IdentityProvider for OidcProvider {
    async fn refresh(&self, session: &Session) -> Result<TokenSet> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .context("session has no refresh token")?;
        let metadata = self.discover(&session.issuer).await?;
        debug!(target: "session", web_id = %session.web_id, "refreshing access token");
        self.token_request(
            &metadata.token_endpoint,
            &session.client_id,
            session.client_secret.as_deref(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}
