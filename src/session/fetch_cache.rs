use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use jiff::{SignedDuration, Timestamp};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{IdentityProvider, SessionStore, TokenSet};
use crate::pod::PodClient;

/// Lifetime assumed for access tokens issued without `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 300;

struct CachedToken {
    access_token: Arc<SecretString>,
    expires_at: Timestamp,
}

type Slot = Arc<Mutex<Option<CachedToken>>>;

/// Process-wide cache of Pod access per WebID.
///
/// Each WebID has its own slot; holding the slot lock across the refresh
/// makes concurrent callers wait for a single token request instead of
/// racing the identity provider with the same refresh token.
pub(crate) struct FetchCache<P> {
    provider: P,
    store: SessionStore,
    client: Client,
    refresh_skew: SignedDuration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<P: IdentityProvider> FetchCache<P> {
    pub(crate) fn new(
        provider: P,
        store: SessionStore,
        client: Client,
        refresh_skew_secs: i64,
    ) -> FetchCache<P> {
        FetchCache {
            provider,
            store,
            client,
            refresh_skew: SignedDuration::from_secs(refresh_skew_secs),
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn provider(&self) -> &P {
        &self.provider
    }

    async fn slot(&self, web_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots.entry(web_id.to_string()).or_default().clone()
    }

    fn still_valid(&self, cached: &CachedToken) -> bool {
        Timestamp::now()
            .checked_add(self.refresh_skew)
            .map(|deadline| deadline < cached.expires_at)
            .unwrap_or(false)
    }

    fn cached(tokens: &TokenSet) -> CachedToken {
        let lifetime = tokens.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Timestamp::now()
            .checked_add(SignedDuration::from_secs(lifetime))
            .unwrap_or_else(|_| Timestamp::now());
        CachedToken {
            access_token: Arc::new(SecretString::from(
                tokens.access_token.expose_secret().to_string(),
            )),
            expires_at,
        }
    }

    /// A Pod client acting as `web_id`, refreshing its token when needed.
    pub(crate) async fn pod_client(&self, web_id: &str) -> Result<PodClient> {
        let slot = self.slot(web_id).await;
        let mut guard = slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if self.still_valid(cached) {
                return Ok(PodClient::authenticated(
                    self.client.clone(),
                    cached.access_token.clone(),
                ));
            }
        }

        let session = self
            .store
            .find_by_web_id(web_id)?
            .context("no stored session for this webid")?;
        let tokens = self
            .provider
            .refresh(&session)
            .await
            .context("unable to refresh pod access")?;
        if let Some(rotated) = tokens.refresh_token.as_deref() {
            self.store.update_refresh_token(web_id, rotated)?;
        }
        let cached = Self::cached(&tokens);
        let client = PodClient::authenticated(self.client.clone(), cached.access_token.clone());
        *guard = Some(cached);
        debug!(target: "session", %web_id, "pod access hydrated");
        Ok(client)
    }

    /// Seeds the cache with tokens obtained at login.
    pub(crate) async fn seed(&self, web_id: &str, tokens: &TokenSet) {
        let slot = self.slot(web_id).await;
        *slot.lock().await = Some(Self::cached(tokens));
    }

    pub(crate) async fn evict(&self, web_id: &str) {
        if self.slots.lock().await.remove(web_id).is_some() {
            info!(target: "session", %web_id, "pod access evicted");
        }
    }

    pub(crate) fn anonymous(&self) -> PodClient {
        PodClient::anonymous(self.client.clone())
    }
}
