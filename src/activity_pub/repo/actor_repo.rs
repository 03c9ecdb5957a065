use anyhow::{Context, Result};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;

use crate::activity_pub::model::{Actor, Object};

/// Local copies of actor documents, served without touching the Pod.
#[derive(Clone)]
pub(crate) struct ActorRepo {
    actors: PartitionHandle,
}

impl ActorRepo {
    pub(crate) fn new(keyspace: Keyspace) -> Result<ActorRepo> {
        let actors = keyspace.open_partition("actors", PartitionCreateOptions::default())?;
        Ok(ActorRepo { actors })
    }
    pub(crate) fn insert(&self, username: &str, actor: Actor<'_>) -> Result<()> {
        let bytes = serde_json::to_vec(&Value::from(actor)).context("unable to serialize actor")?;
        self.actors.insert(username, bytes)?;
        Ok(())
    }
    pub(crate) fn find_one(&self, username: &str) -> Result<Option<Actor<'static>>> {
        if let Some(bytes) = self.actors.get(username)? {
            let value: Value =
                serde_json::from_slice(&bytes).context("unable to deserialize actor")?;
            return Ok(Some(Actor::from(Object::from(value))));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use fjall::{Config, Keyspace};
    use tempfile::tempdir;

    use super::{Actor, ActorRepo};
    use crate::activity_pub::model::Profile;
    use crate::config::ActivityPubConfig;

    #[test]
    fn insert_then_find() -> Result<()> {
        let tmp_dir = tempdir()?;
        let keyspace = Keyspace::open(Config::new(tmp_dir.path()).temporary(true))?;
        let repo = ActorRepo::new(keyspace)?;
        let profile = Profile {
            username: "kenzoishii".to_string(),
            name: Some("石井健蔵".to_string()),
            summary: Some("この方はただの例です".to_string()),
            ..Default::default()
        };
        let actor = Actor::local(&ActivityPubConfig::default(), &profile, "PEM");
        repo.insert("kenzoishii", actor.clone())?;
        assert_eq!(Some(actor), repo.find_one("kenzoishii")?);
        assert_eq!(None, repo.find_one("nobody")?);
        Ok(())
    }
}
