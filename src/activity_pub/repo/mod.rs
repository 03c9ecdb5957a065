mod actor_repo;
mod directory;

pub(crate) use actor_repo::ActorRepo;
pub(crate) use directory::{ActorLocation, Directory, DirectoryError, Mapping, normalize_username};
