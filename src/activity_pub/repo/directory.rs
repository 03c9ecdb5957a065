use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use jiff::Timestamp;
use minicbor::{Decode, Encode};
use thiserror::Error;
use tracing::info;

use crate::pod::pod_url_from_web_id;

#[derive(Debug, Error)]
pub(crate) enum DirectoryError {
    #[error("Invalid username {0:?}: use lowercase letters, digits, '_' or '-'")]
    InvalidUsername(String),
    #[error("Username already taken")]
    UsernameTaken,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<fjall::Error> for DirectoryError {
    fn from(error: fjall::Error) -> Self {
        DirectoryError::Storage(error.into())
    }
}

/// A registered WebID and the local actor it federates as.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) struct Mapping {
    #[n(0)]
    pub(crate) web_id: String,
    #[n(1)]
    pub(crate) username: String,
    #[n(2)]
    pub(crate) actor_id: String,
    #[n(3)]
    pub(crate) created_at: i64,
    /// Pod storage advertised by the WebID profile, when known.
    #[n(4)]
    pub(crate) storage: Option<String>,
}

impl Mapping {
    pub(crate) fn pod_url(&self) -> Option<String> {
        match &self.storage {
            Some(storage) => Some(storage.clone()),
            None => pod_url_from_web_id(&self.web_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActorLocation {
    pub(crate) web_id: String,
    pub(crate) pod_url: String,
    pub(crate) actor_id: String,
}

/// Case-folds and validates a username.
pub(crate) fn normalize_username(username: &str) -> Result<String, DirectoryError> {
    let username = username.trim().to_lowercase();
    let valid = !username.is_empty()
        && username
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(username)
    } else {
        Err(DirectoryError::InvalidUsername(username))
    }
}

/// Local identity registry: WebID <-> username, both unique.
#[derive(Clone)]
pub(crate) struct Directory {
    keyspace: Keyspace,
    by_web_id: PartitionHandle,
    by_username: PartitionHandle,
    registration: Arc<Mutex<()>>,
}

impl Directory {
    pub(crate) fn new(keyspace: Keyspace) -> anyhow::Result<Directory> {
        let by_web_id = keyspace.open_partition("webid_index", PartitionCreateOptions::default())?;
        let by_username =
            keyspace.open_partition("username_index", PartitionCreateOptions::default())?;
        Ok(Directory {
            keyspace,
            by_web_id,
            by_username,
            registration: Arc::new(Mutex::new(())),
        })
    }

    /// Maps `web_id` to `username`. Registering a WebID again returns its
    /// original mapping.
    pub(crate) fn register(
        &self,
        web_id: &str,
        username: &str,
        actor_id: &str,
        storage: Option<&str>,
    ) -> Result<Mapping, DirectoryError> {
        let username = normalize_username(username)?;
        let _guard = self
            .registration
            .lock()
            .map_err(|_| anyhow!("directory registration lock poisoned"))?;

        if let Some(existing) = self.find_by_web_id(web_id)? {
            return Ok(existing);
        }
        if self.by_username.contains_key(username.as_str())? {
            return Err(DirectoryError::UsernameTaken);
        }
        let mapping = Mapping {
            web_id: web_id.to_string(),
            username: username.clone(),
            actor_id: actor_id.to_string(),
            created_at: Timestamp::now().as_second(),
            storage: storage.map(str::to_string),
        };
        let bytes = minicbor::to_vec(&mapping).context("unable to serialize mapping")?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.by_web_id, web_id, bytes);
        batch.insert(&self.by_username, username.as_str(), web_id);
        batch.commit()?;
        info!(target: "apub", %web_id, %username, "actor registered");
        Ok(mapping)
    }

    pub(crate) fn find_by_web_id(&self, web_id: &str) -> anyhow::Result<Option<Mapping>> {
        let Some(bytes) = self.by_web_id.get(web_id)? else {
            return Ok(None);
        };
        Ok(Some(
            minicbor::decode(&bytes).context("unable to deserialize mapping")?,
        ))
    }

    pub(crate) fn find_by_username(&self, username: &str) -> anyhow::Result<Option<Mapping>> {
        let Some(web_id) = self.by_username.get(username.to_lowercase())? else {
            return Ok(None);
        };
        let web_id = std::str::from_utf8(&web_id).context("corrupted username index")?;
        self.find_by_web_id(web_id)
    }

    pub(crate) fn lookup(&self, username: &str) -> anyhow::Result<Option<ActorLocation>> {
        let Some(mapping) = self.find_by_username(username)? else {
            return Ok(None);
        };
        let pod_url = mapping
            .pod_url()
            .context("webid has no authority to derive a pod from")?;
        Ok(Some(ActorLocation {
            web_id: mapping.web_id,
            pod_url,
            actor_id: mapping.actor_id,
        }))
    }
}
