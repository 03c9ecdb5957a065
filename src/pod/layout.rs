use reqwest::Url;

use super::AclPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Container {
    Inbox,
    Outbox,
    Followers,
    Following,
    Activities,
    Settings,
    Profile,
}

impl Container {
    pub(crate) const ALL: [Container; 7] = [
        Container::Inbox,
        Container::Outbox,
        Container::Followers,
        Container::Following,
        Container::Activities,
        Container::Settings,
        Container::Profile,
    ];

    fn path(self) -> &'static str {
        match self {
            Container::Inbox => "inbox/",
            Container::Outbox => "outbox/",
            Container::Followers => "followers/",
            Container::Following => "following/",
            Container::Activities => "activities/",
            Container::Settings => "settings/",
            Container::Profile => "profile/",
        }
    }

    pub(crate) fn policy(self) -> AclPolicy {
        match self {
            Container::Inbox => AclPolicy::PublicAppendPrivateRead,
            Container::Settings => AclPolicy::PrivateOwnerOnly,
            Container::Outbox
            | Container::Followers
            | Container::Following
            | Container::Activities
            | Container::Profile => AclPolicy::PublicReadOwnerWrite,
        }
    }
}

/// Where this application keeps a user's data inside their Pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PodLayout {
    app_root: String,
}

impl PodLayout {
    pub(crate) fn new(pod_url: &str, app_container: &str) -> PodLayout {
        let mut app_root = pod_url.to_string();
        if !app_root.ends_with('/') {
            app_root.push('/');
        }
        app_root.push_str(app_container.trim_start_matches('/'));
        if !app_root.ends_with('/') {
            app_root.push('/');
        }
        PodLayout { app_root }
    }
    pub(crate) fn app_root(&self) -> &str {
        &self.app_root
    }
    pub(crate) fn container(&self, container: Container) -> String {
        format!("{}{}", self.app_root, container.path())
    }
    pub(crate) fn resource(&self, container: Container, slug: &str) -> String {
        format!("{}{}", self.container(container), slug)
    }
    pub(crate) fn keys(&self) -> String {
        self.resource(Container::Settings, "keys")
    }
    pub(crate) fn followers_list(&self) -> String {
        self.resource(Container::Followers, "list")
    }
    pub(crate) fn following_list(&self) -> String {
        self.resource(Container::Following, "list")
    }
    pub(crate) fn actor_document(&self) -> String {
        self.resource(Container::Profile, "actor")
    }
}

/// The Pod root of a WebID without a discovered storage: its authority.
pub(crate) fn pod_url_from_web_id(web_id: &str) -> Option<String> {
    let url = Url::parse(web_id).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}/", url.scheme()),
        None => format!("{}://{host}/", url.scheme()),
    })
}
