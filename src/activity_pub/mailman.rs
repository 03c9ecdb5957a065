use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::http::{HeaderValue, Method};
use reqwest::{Client, StatusCode, Url, header};
use serde_json::Value;
use tracing::debug;

use super::hs2019::{KeyResolver, PublicKey, SignRequest, sign_now};
use super::keys::SigningKey;
use super::model::{Actor, Object};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
const APPLICATION_LD_JSON: HeaderValue = HeaderValue::from_static(
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
);
const ACCEPT_ACTIVITY: HeaderValue = HeaderValue::from_static(
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
);

/// Talks to remote ActivityPub servers. Every call is bounded by the
/// configured timeout.
#[derive(Clone)]
pub(crate) struct Mailman {
    client: Client,
}

impl Mailman {
    pub(crate) fn new(timeout: Duration) -> Result<Mailman> {
        Ok(Mailman {
            client: Client::builder()
                .http1_only()
                .user_agent(APP_USER_AGENT)
                .gzip(true)
                .timeout(timeout)
                .build()
                .context("unable to build http client")?,
        })
    }
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
    pub(crate) async fn fetch(&self, iri: &str) -> Result<Value> {
        let response = self
            .client
            .get(iri)
            .header(header::ACCEPT, ACCEPT_ACTIVITY)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("fetching {iri} failed with {}", response.status());
        }
        Ok(response.json().await?)
    }
    pub(crate) async fn fetch_actor(&self, iri: &str) -> Result<Actor<'static>> {
        let document = self.fetch(iri).await?;
        Ok(Actor::from(Object::from(document)))
    }
    pub(crate) async fn resolve_inbox(&self, actor_iri: &str) -> Result<String> {
        let actor = self.fetch_actor(actor_iri).await?;
        let inbox = actor
            .inbox()
            .with_context(|| format!("actor {actor_iri} has no inbox"))?;
        Ok(inbox.to_string())
    }
    /// Delivers `body` to `inbox` with an HTTP signature made by `key`.
    ///
    /// Returns the response status; transport errors and timeouts are errors.
    pub(crate) async fn post_signed(
        &self,
        inbox: &str,
        body: &Value,
        key: &SigningKey,
    ) -> Result<StatusCode> {
        let body = serde_json::to_vec(body)?;
        let headers = sign_now(
            key,
            SignRequest {
                method: &Method::POST,
                url: inbox,
                body: Some(&body),
            },
        )?;
        let response = self
            .client
            .post(inbox)
            .header(header::CONTENT_TYPE, APPLICATION_LD_JSON)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(target: "apub", %inbox, %status, %text, "delivery rejected");
        }
        Ok(status)
    }
}

impl KeyResolver for Mailman {
    async fn public_key(&self, actor_iri: &str) -> Result<PublicKey> {
        let actor = self.fetch_actor(actor_iri).await?;
        let pem = actor
            .public_key_pem()
            .context("actor publishes no public key")?
            .to_string();
        let id = actor.id().context("key document has no id")?;
        if id.split('#').next() != Some(actor_iri) {
            bail!("key document {id} was served for {actor_iri}");
        }
        let owner = actor.key_owner().unwrap_or(actor_iri);
        // A standalone key may live apart from its owner, but not on another host.
        let bound = if actor.is_key() {
            same_origin(owner, actor_iri)
        } else {
            owner == actor_iri
        };
        if !bound {
            bail!("key of {actor_iri} claims owner {owner}");
        }
        Ok(PublicKey {
            owner: owner.to_string(),
            pem,
        })
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}
