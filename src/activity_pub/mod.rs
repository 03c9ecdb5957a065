pub(crate) mod hs2019;
pub(crate) mod inbox;
pub(crate) mod keys;
pub(crate) mod mailman;
pub(crate) mod model;
pub(crate) mod outbox;
mod repo;
pub(crate) mod social;

pub(crate) use repo::{ActorLocation, ActorRepo, Directory, DirectoryError, Mapping, normalize_username};
