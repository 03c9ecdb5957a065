use anyhow::{Context, Result};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use jiff::Timestamp;
use minicbor::{Decode, Encode};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::random_token;

/// A logged-in user. One record per WebID, shared by every browser session
/// of that user.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) struct Session {
    #[n(0)]
    pub(crate) web_id: String,
    /// Set once the WebID registered an actor.
    #[n(1)]
    pub(crate) username: Option<String>,
    #[n(2)]
    pub(crate) issuer: String,
    #[n(3)]
    pub(crate) client_id: String,
    #[n(4)]
    pub(crate) client_secret: Option<String>,
    #[n(5)]
    pub(crate) refresh_token: Option<String>,
    #[n(6)]
    pub(crate) pod_url: Option<String>,
}

/// State kept across the identity provider redirect.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) struct PendingSession {
    #[n(0)]
    pub(crate) cookie_session_id: String,
    #[n(1)]
    pub(crate) issuer: String,
    #[n(2)]
    pub(crate) code_verifier: String,
    #[n(3)]
    pub(crate) created_at: i64,
}

#[derive(Debug, Encode, Decode)]
struct CookieBinding {
    #[n(0)]
    storage_key: String,
    #[n(1)]
    created_at: i64,
}

#[derive(Clone)]
pub(crate) struct SessionStore {
    keyspace: Keyspace,
    cookies: PartitionHandle,
    sessions: PartitionHandle,
    pending: PartitionHandle,
    max_age_secs: i64,
    pending_max_age_secs: i64,
}

fn storage_key(web_id: &str) -> String {
    Sha256::digest(web_id.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn encode<T: Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value).context("unable to serialize session record")?)
}

fn decode<'b, T: Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T> {
    Ok(minicbor::decode(bytes).context("unable to deserialize session record")?)
}

impl SessionStore {
    pub(crate) fn new(
        keyspace: Keyspace,
        max_age_secs: i64,
        pending_max_age_secs: i64,
    ) -> Result<SessionStore> {
        let cookies =
            keyspace.open_partition("session_cookies", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        let pending =
            keyspace.open_partition("pending_sessions", PartitionCreateOptions::default())?;
        Ok(SessionStore {
            keyspace,
            cookies,
            sessions,
            pending,
            max_age_secs,
            pending_max_age_secs,
        })
    }

    /// Stores `session` and binds a fresh cookie session id to it.
    ///
    /// An existing record of the same WebID keeps its username.
    pub(crate) fn create(&self, mut session: Session) -> Result<String> {
        let key = storage_key(&session.web_id);
        if session.username.is_none() {
            if let Some(existing) = self.find_by_web_id(&session.web_id)? {
                session.username = existing.username;
            }
        }
        let session_id = random_token()?;
        let binding = CookieBinding {
            storage_key: key.clone(),
            created_at: Timestamp::now().as_second(),
        };
        let mut batch = self.keyspace.batch();
        batch.insert(&self.sessions, key.as_str(), encode(&session)?);
        batch.insert(&self.cookies, session_id.as_str(), encode(&binding)?);
        batch.commit()?;
        debug!(target: "session", web_id = %session.web_id, "session created");
        Ok(session_id)
    }

    /// Resolves a cookie session id. Expired bindings are removed.
    pub(crate) fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(bytes) = self.cookies.get(session_id)? else {
            return Ok(None);
        };
        let binding: CookieBinding = decode(&bytes)?;
        if Timestamp::now().as_second() - binding.created_at > self.max_age_secs {
            self.cookies.remove(session_id)?;
            return Ok(None);
        }
        match self.sessions.get(binding.storage_key.as_str())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn find_by_web_id(&self, web_id: &str) -> Result<Option<Session>> {
        match self.sessions.get(storage_key(web_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update(&self, web_id: &str, f: impl FnOnce(&mut Session)) -> Result<()> {
        let mut session = self
            .find_by_web_id(web_id)?
            .context("no session stored for webid")?;
        f(&mut session);
        self.sessions.insert(storage_key(web_id), encode(&session)?)?;
        Ok(())
    }

    pub(crate) fn set_username(&self, web_id: &str, username: &str) -> Result<()> {
        self.update(web_id, |session| session.username = Some(username.to_string()))
    }

    pub(crate) fn set_pod_url(&self, web_id: &str, pod_url: &str) -> Result<()> {
        self.update(web_id, |session| session.pod_url = Some(pod_url.to_string()))
    }

    pub(crate) fn update_refresh_token(&self, web_id: &str, refresh_token: &str) -> Result<()> {
        self.update(web_id, |session| {
            session.refresh_token = Some(refresh_token.to_string())
        })
    }

    /// Ends a browser session. Returns the WebID it belonged to.
    pub(crate) fn delete(&self, session_id: &str) -> Result<Option<String>> {
        let Some(session) = self.get(session_id)? else {
            self.cookies.remove(session_id)?;
            return Ok(None);
        };
        let mut batch = self.keyspace.batch();
        batch.remove(&self.cookies, session_id);
        batch.remove(&self.sessions, storage_key(&session.web_id));
        batch.commit()?;
        debug!(target: "session", web_id = %session.web_id, "session deleted");
        Ok(Some(session.web_id))
    }

    pub(crate) fn put_pending(&self, state: &str, pending: &PendingSession) -> Result<()> {
        self.pending.insert(state, encode(pending)?)?;
        Ok(())
    }

    /// Removes and returns the pending session for `state` unless it expired.
    pub(crate) fn take_pending(&self, state: &str) -> Result<Option<PendingSession>> {
        let Some(bytes) = self.pending.get(state)? else {
            return Ok(None);
        };
        self.pending.remove(state)?;
        let pending: PendingSession = decode(&bytes)?;
        if Timestamp::now().as_second() - pending.created_at > self.pending_max_age_secs {
            debug!(target: "session", "pending session expired");
            return Ok(None);
        }
        Ok(Some(pending))
    }

    /// Drops pending sessions abandoned mid-login.
    pub(crate) fn purge_pending(&self) -> Result<usize> {
        let now = Timestamp::now().as_second();
        let mut expired = vec![];
        for entry in self.pending.iter() {
            let (key, value) = entry?;
            let stale = match decode::<PendingSession>(&value) {
                Ok(pending) => now - pending.created_at > self.pending_max_age_secs,
                Err(_) => true,
            };
            if stale {
                expired.push(key);
            }
        }
        for key in &expired {
            self.pending.remove(key.clone())?;
        }
        Ok(expired.len())
    }
}
