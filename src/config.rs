use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fjall::Keyspace;
use serde::Deserialize;

#[derive(Clone, Default, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) server: ServerConfig,
    pub(crate) activity_pub: ActivityPubConfig,
    pub(crate) federation: FederationConfig,
    pub(crate) pod: PodConfig,
    pub(crate) session: SessionConfig,
    pub(crate) oidc: OidcConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub(crate) http_port: u16,
    pub(crate) data_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct ActivityPubConfig {
    pub(crate) base_url: String,
    pub(crate) page_size: usize,
    /// Reject inbox deliveries without a valid HTTP signature.
    pub(crate) require_signatures: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct FederationConfig {
    pub(crate) timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct PodConfig {
    /// Sub-tree of every Pod owned by this application, relative to the Pod root.
    pub(crate) app_container: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct SessionConfig {
    pub(crate) cookie_name: String,
    pub(crate) max_age_days: i64,
    pub(crate) pending_max_age_secs: i64,
    /// Access tokens are refreshed this many seconds before they expire.
    pub(crate) refresh_skew_secs: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub(crate) struct OidcConfig {
    pub(crate) client_name: String,
    pub(crate) scope: String,
}

/// Loaded configuration together with process-wide handles.
#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) init: Config,
    pub(crate) keyspace: Keyspace,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Config> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read config file {}", path.display()))?;
            toml::from_str(&text).context("unable to parse config file")?
        } else {
            Config::default()
        };
        if let Ok(base_url) = std::env::var("BASE_URL") {
            config.activity_pub.base_url = base_url;
        }
        config.activity_pub.base_url = config.activity_pub.base_url.trim_end_matches('/').into();
        if !config.pod.app_container.ends_with('/') {
            config.pod.app_container.push('/');
        }
        Ok(config)
    }
}

impl ActivityPubConfig {
    pub(crate) fn actor_iri(&self, username: &str) -> String {
        format!("{}/actors/{}", self.base_url, username)
    }
    pub(crate) fn domain(&self) -> &str {
        self.base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest)
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for ActivityPubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            page_size: 20,
            require_signatures: true,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            app_container: "social/".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "sid".to_string(),
            max_age_days: 7,
            pending_max_age_secs: 600,
            refresh_skew_secs: 60,
        }
    }
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            client_name: "podfed".to_string(),
            scope: "openid webid offline_access".to_string(),
        }
    }
}
