mod actor;
mod collection;
mod create;
mod note;
mod object;

pub(crate) use actor::{Actor, Profile};
pub(crate) use collection::{PageError, parse_page, render_collection};
pub(crate) use create::Create;
pub(crate) use note::Note;
pub(crate) use object::{Object, is_public_iri};

pub(crate) const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Activity types accepted from local clients and from remote servers.
pub(crate) const ALLOWED_ACTIVITY_TYPES: [&str; 6] =
    ["Create", "Like", "Undo", "Follow", "Accept", "Announce"];
