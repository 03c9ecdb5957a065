//! Authenticated access to a user's Solid Pod.
//!
//! Reads and listings fall back to an anonymous request when the Pod refuses
//! the credentials, so public data stays reachable with a stale session.
//! Failures of best-effort operations are logged and reported as empty
//! values; only container creation and explicit puts propagate errors.

mod acl;
mod layout;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use reqwest::header::{self, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

pub(crate) use acl::{AclPolicy, render_acl};
pub(crate) use layout::{Container, PodLayout, pod_url_from_web_id};

const LD_JSON: &str = "application/ld+json";
const TURTLE: &str = "text/turtle";
const BASIC_CONTAINER: &str = "<http://www.w3.org/ns/ldp#BasicContainer>; rel=\"type\"";
const LDP_CONTAINS: [&str; 3] = ["ldp:contains", "http://www.w3.org/ns/ldp#contains", "contains"];

#[derive(Clone)]
pub(crate) struct PodClient {
    client: Client,
    bearer: Option<Arc<SecretString>>,
}

impl PodClient {
    pub(crate) fn anonymous(client: Client) -> PodClient {
        PodClient {
            client,
            bearer: None,
        }
    }
    pub(crate) fn authenticated(client: Client, access_token: Arc<SecretString>) -> PodClient {
        PodClient {
            client,
            bearer: Some(access_token),
        }
    }
    pub(crate) fn is_authenticated(&self) -> bool {
        self.bearer.is_some()
    }

    fn request(&self, method: Method, url: &str, with_credentials: bool) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match (&self.bearer, with_credentials) {
            (Some(token), true) => builder.bearer_auth(token.expose_secret()),
            _ => builder,
        }
    }

    /// Sends a read request, retrying once without credentials when the Pod
    /// rejects them. A missing resource is `None`; every other refusal is an
    /// error.
    async fn try_read(&self, url: &str, accept: &str) -> Result<Option<Response>> {
        let send = |with_credentials: bool| {
            self.request(Method::GET, url, with_credentials)
                .header(header::ACCEPT, accept)
                .send()
        };
        let mut response = send(true)
            .await
            .with_context(|| format!("unable to read {url}"))?;
        let status = response.status();
        if self.is_authenticated()
            && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN)
        {
            debug!(target: "pod", %url, %status, "retrying read without credentials");
            response = send(false)
                .await
                .with_context(|| format!("unable to read {url} anonymously"))?;
        }
        match response.status() {
            status if status.is_success() => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            status => bail!("reading {url} failed with {status}"),
        }
    }

    async fn read(&self, url: &str, accept: &str) -> Option<Response> {
        match self.try_read(url, accept).await {
            Ok(response) => response,
            Err(error) => {
                warn!(target: "pod", %url, error = format!("{error:#}"), "read failed");
                None
            }
        }
    }

    /// Creates a container if it does not exist yet and applies `policy` to it.
    pub(crate) async fn ensure_container(
        &self,
        url: &str,
        owner_web_id: &str,
        policy: AclPolicy,
    ) -> Result<()> {
        let response = self
            .request(Method::PUT, url, true)
            .header(header::CONTENT_TYPE, TURTLE)
            .header(header::LINK, HeaderValue::from_static(BASIC_CONTAINER))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::CONFLICT {
            bail!("unable to create container {url}: {status}");
        }
        let acl_url = format!("{url}.acl");
        if !self
            .write_turtle(&acl_url, &render_acl(policy, url, owner_web_id))
            .await
        {
            bail!("unable to write access control for {url}");
        }
        debug!(target: "pod", %url, ?policy, "container ready");
        Ok(())
    }

    /// Writes a JSON-LD resource. With a slug the resource lands at
    /// `container_url + slug`, otherwise the Pod picks the name.
    ///
    /// Returns the location of the new resource.
    pub(crate) async fn write_resource(
        &self,
        container_url: &str,
        payload: &Value,
        slug: Option<&str>,
    ) -> Option<String> {
        let request = match slug {
            Some(slug) => self.request(Method::PUT, &format!("{container_url}{slug}"), true),
            None => self.request(Method::POST, container_url, true),
        };
        let response = match request
            .header(header::CONTENT_TYPE, LD_JSON)
            .body(payload.to_string())
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(target: "pod", container = %container_url, %error, "write failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(target: "pod", container = %container_url, status = %response.status(), "write refused");
            return None;
        }
        match slug {
            Some(slug) => Some(format!("{container_url}{slug}")),
            None => {
                let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
                resolve(container_url, location)
            }
        }
    }

    /// Replaces the resource at `url` with a JSON-LD document.
    pub(crate) async fn put_json(&self, url: &str, payload: &Value) -> Result<()> {
        let response = self
            .request(Method::PUT, url, true)
            .header(header::CONTENT_TYPE, LD_JSON)
            .body(payload.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("unable to write {url}: {}", response.status());
        }
        Ok(())
    }

    /// Reads a resource that is about to be rewritten. Only absence is
    /// `None`; a failed read must not be mistaken for an empty resource.
    pub(crate) async fn read_for_update(&self, url: &str) -> Result<Option<Value>> {
        let Some(response) = self.try_read(url, LD_JSON).await? else {
            return Ok(None);
        };
        let value = response
            .json()
            .await
            .with_context(|| format!("{url} is not json"))?;
        Ok(Some(value))
    }

    pub(crate) async fn read_resource(&self, url: &str) -> Option<Value> {
        let response = self.read(url, LD_JSON).await?;
        match response.json().await {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(target: "pod", %url, %error, "resource is not json");
                None
            }
        }
    }

    /// Lists the member URLs of a container.
    pub(crate) async fn list_container(&self, url: &str) -> Vec<String> {
        let Some(response) = self.read(url, LD_JSON).await else {
            return vec![];
        };
        match response.json::<Value>().await {
            Ok(listing) => parse_listing(url, &listing),
            Err(error) => {
                warn!(target: "pod", %url, %error, "container listing is not json");
                vec![]
            }
        }
    }

    pub(crate) async fn delete_resource(&self, url: &str) -> bool {
        match self.request(Method::DELETE, url, true).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                warn!(target: "pod", %url, %error, "delete failed");
                false
            }
        }
    }

    pub(crate) async fn write_turtle(&self, url: &str, content: &str) -> bool {
        let result = self
            .request(Method::PUT, url, true)
            .header(header::CONTENT_TYPE, TURTLE)
            .body(content.to_string())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(target: "pod", %url, status = %response.status(), "turtle write refused");
                false
            }
            Err(error) => {
                warn!(target: "pod", %url, %error, "turtle write failed");
                false
            }
        }
    }
}

fn resolve(base: &str, reference: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(reference).ok().map(String::from)
}

/// Extracts `ldp:contains` members from a JSON-LD container description.
///
/// Accepts compacted documents, `@graph` wrappers and expanded arrays.
/// Relative member ids resolve against the container URL.
pub(crate) fn parse_listing(container_url: &str, listing: &Value) -> Vec<String> {
    fn nodes(value: &Value) -> Vec<&Value> {
        match value {
            Value::Array(items) => items.iter().flat_map(nodes).collect(),
            Value::Object(map) => match map.get("@graph") {
                Some(graph) => nodes(graph),
                None => vec![value],
            },
            _ => vec![],
        }
    }
    fn member_ids(value: &Value) -> Vec<&str> {
        match value {
            Value::String(id) => vec![id.as_str()],
            Value::Array(items) => items.iter().flat_map(member_ids).collect(),
            Value::Object(map) => map
                .get("@id")
                .or_else(|| map.get("id"))
                .and_then(Value::as_str)
                .into_iter()
                .collect(),
            _ => vec![],
        }
    }

    let mut members: Vec<String> = vec![];
    for node in nodes(listing) {
        for key in LDP_CONTAINS {
            let Some(contains) = node.get(key) else {
                continue;
            };
            for id in member_ids(contains) {
                if let Some(url) = resolve(container_url, id) {
                    if !members.contains(&url) {
                        members.push(url);
                    }
                }
            }
        }
    }
    members
}
