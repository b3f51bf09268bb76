//! Talking to the depot.
//!
//! [`ServerApi`] is the client's view of the depot. [`HttpServerApi`] speaks
//! JSON over HTTP with retry and backoff; [`LocalServerApi`] calls a
//! [`CookbookServer`] in-process, for a depot repository on local disk.

use crate::error::{Error, Result};
use crate::sync::FileFetcher;
use backoff::{BackoffPolicy, with_retry};
use depot::{
    ApiClient, BaseUrl, CookbookServer, CreateSandboxRequest, CreateSandboxResponse, Node, Role,
    Sandbox, UpdateSandboxRequest, UriResponse,
};
use manifest::{CookbookManifest, Digest};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Maximum size of one downloaded cookbook file.
const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Header carrying the client name.
pub const CLIENT_HEADER: &str = "X-Pantry-Client";
/// Header carrying the client credential.
pub const KEY_HEADER: &str = "X-Pantry-Key";

/// Depot operations the client uses.
pub trait ServerApi: FileFetcher {
    /// Authenticate subsequent requests as `client_name`.
    fn use_credentials(&mut self, client_name: &str, key: &str) -> Result<()>;

    fn register_client(&self, name: &str) -> Result<ApiClient>;

    /// The stored node record, `None` if the depot has never seen it.
    fn load_node(&self, name: &str) -> Result<Option<Node>>;

    fn create_node(&self, node: &Node) -> Result<()>;

    fn update_node(&self, node: &Node) -> Result<Node>;

    fn load_role(&self, name: &str) -> Result<Role>;

    /// Manifests, with download URLs, of every cookbook the node needs.
    fn cookbooks_for_node(&self, name: &str) -> Result<BTreeMap<String, CookbookManifest>>;

    fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<CreateSandboxResponse>;

    /// Upload one file to the URL a sandbox handed out.
    fn upload_checksum(&self, url: &str, bytes: &[u8]) -> Result<()>;

    /// Mark the sandbox at `uri` complete, committing its files.
    fn commit_sandbox(&self, uri: &str) -> Result<Sandbox>;

    fn store_cookbook(&self, manifest: &CookbookManifest) -> Result<()>;
}

/// Trailing path segment of a URI.
fn last_segment(uri: &str) -> Result<&str> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::config(format!("malformed URI '{uri}'")))
}

/// `(guid, digest)` from a sandbox upload URL.
fn parse_upload_url(url: &str) -> Result<(&str, Digest)> {
    let mut parts = url.trim_end_matches('/').rsplit('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(digest), Some(guid), Some("sandboxes")) => Ok((guid, Digest::new(digest))),
        _ => Err(Error::config(format!("malformed upload URL '{url}'"))),
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// JSON-over-HTTP depot client.
pub struct HttpServerApi {
    agent: ureq::Agent,
    base_url: String,
    retry: BackoffPolicy,
    client_name: Option<String>,
    key: Option<String>,
}

impl HttpServerApi {
    pub fn new(base_url: impl Into<String>, retry: BackoffPolicy) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
            client_name: None,
            key: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize<B>(&self, mut request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        if let Some(name) = &self.client_name {
            request = request.header(CLIENT_HEADER, name);
        }
        if let Some(key) = &self.key {
            request = request.header(KEY_HEADER, key);
        }
        request
    }

    /// Run one request with retry, labelling transport failures with `url`.
    fn retrying<T>(&self, url: &str, mut op: impl FnMut() -> std::result::Result<T, ureq::Error>) -> Result<T> {
        with_retry(self.retry.generator(), None, || {
            op().map_err(|e| match Error::from(e) {
                Error::Network { message, .. } => Error::network(url, message),
                other => other,
            })
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        log::debug!("GET {url}");
        self.retrying(url, || {
            self.authorize(self.agent.get(url))
                .header("Accept", "application/json")
                .call()?
                .body_mut()
                .read_json()
        })
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        log::debug!("POST {url}");
        self.retrying(url, || {
            self.authorize(self.agent.post(url))
                .send_json(body)?
                .body_mut()
                .read_json()
        })
    }

    fn put_json<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        log::debug!("PUT {url}");
        self.retrying(url, || {
            self.authorize(self.agent.put(url))
                .send_json(body)?
                .body_mut()
                .read_json()
        })
    }
}

impl FileFetcher for HttpServerApi {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        log::debug!("GET {url}");
        self.retrying(url, || {
            self.authorize(self.agent.get(url))
                .call()?
                .body_mut()
                .with_config()
                .limit(MAX_BODY_SIZE)
                .read_to_vec()
        })
    }
}

impl ServerApi for HttpServerApi {
    fn use_credentials(&mut self, client_name: &str, key: &str) -> Result<()> {
        self.client_name = Some(client_name.to_string());
        self.key = Some(key.to_string());
        Ok(())
    }

    fn register_client(&self, name: &str) -> Result<ApiClient> {
        self.post_json(&self.url("clients"), &serde_json::json!({ "name": name }))
    }

    fn load_node(&self, name: &str) -> Result<Option<Node>> {
        match self.get_json::<Node>(&self.url(&format!("nodes/{name}"))) {
            Ok(mut node) => {
                node.exists_remotely = true;
                Ok(Some(node))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_node(&self, node: &Node) -> Result<()> {
        let _: UriResponse = self.post_json(&self.url("nodes"), node)?;
        Ok(())
    }

    fn update_node(&self, node: &Node) -> Result<Node> {
        let mut saved: Node = self.put_json(&self.url(&format!("nodes/{}", node.name)), node)?;
        saved.exists_remotely = true;
        Ok(saved)
    }

    fn load_role(&self, name: &str) -> Result<Role> {
        self.get_json(&self.url(&format!("roles/{name}")))
    }

    fn cookbooks_for_node(&self, name: &str) -> Result<BTreeMap<String, CookbookManifest>> {
        self.get_json(&self.url(&format!("nodes/{name}/cookbooks")))
    }

    fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<CreateSandboxResponse> {
        self.post_json(&self.url("sandboxes"), request)
    }

    fn upload_checksum(&self, url: &str, bytes: &[u8]) -> Result<()> {
        log::debug!("PUT {url} ({} bytes)", bytes.len());
        let _: UriResponse = self.retrying(url, || {
            self.authorize(self.agent.put(url))
                .header("Content-Type", "application/octet-stream")
                .send(bytes)?
                .body_mut()
                .read_json()
        })?;
        Ok(())
    }

    fn commit_sandbox(&self, uri: &str) -> Result<Sandbox> {
        self.put_json(uri, &UpdateSandboxRequest { is_completed: true })
    }

    fn store_cookbook(&self, manifest: &CookbookManifest) -> Result<()> {
        let url = self.url(&format!(
            "cookbooks/{}/{}",
            manifest.cookbook_name, manifest.version
        ));
        let _: UriResponse = self.put_json(&url, manifest)?;
        Ok(())
    }
}

// ============================================================================
// In-process
// ============================================================================

/// Depot on local disk, called directly.
pub struct LocalServerApi {
    server: CookbookServer,
}

impl LocalServerApi {
    pub fn new(server: CookbookServer) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &CookbookServer {
        &self.server
    }
}

impl FileFetcher for LocalServerApi {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let (name, version, digest) = BaseUrl::parse_cookbook_file(url)
            .ok_or_else(|| Error::config(format!("malformed cookbook file URL '{url}'")))?;
        Ok(self.server.cookbook_file(&name, &version, &digest)?)
    }
}

impl ServerApi for LocalServerApi {
    fn use_credentials(&mut self, client_name: &str, key: &str) -> Result<()> {
        Ok(self.server.authenticate(client_name, key)?)
    }

    fn register_client(&self, name: &str) -> Result<ApiClient> {
        Ok(self.server.register_client(name)?)
    }

    fn load_node(&self, name: &str) -> Result<Option<Node>> {
        match self.server.node(name) {
            Ok(node) => Ok(Some(node)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_node(&self, node: &Node) -> Result<()> {
        self.server.create_node(node)?;
        Ok(())
    }

    fn update_node(&self, node: &Node) -> Result<Node> {
        Ok(self.server.update_node(&node.name, node)?)
    }

    fn load_role(&self, name: &str) -> Result<Role> {
        Ok(self.server.role(name)?)
    }

    fn cookbooks_for_node(&self, name: &str) -> Result<BTreeMap<String, CookbookManifest>> {
        Ok(self.server.cookbooks_for_node(name)?)
    }

    fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<CreateSandboxResponse> {
        Ok(self.server.create_sandbox(request)?)
    }

    fn upload_checksum(&self, url: &str, bytes: &[u8]) -> Result<()> {
        let (guid, digest) = parse_upload_url(url)?;
        let mut body = bytes;
        self.server.upload_checksum(guid, &digest, &mut body)?;
        Ok(())
    }

    fn commit_sandbox(&self, uri: &str) -> Result<Sandbox> {
        let guid = last_segment(uri)?;
        Ok(self
            .server
            .update_sandbox(guid, &UpdateSandboxRequest { is_completed: true })?)
    }

    fn store_cookbook(&self, manifest: &CookbookManifest) -> Result<()> {
        self.server.store_cookbook(manifest)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use depot::DepotConfig;
    use tempfile::TempDir;

    pub(crate) fn local_api(tmp: &TempDir) -> LocalServerApi {
        LocalServerApi::new(DepotConfig::new(tmp.path().join("depot")).open().unwrap())
    }

    #[test]
    fn test_parse_upload_url() {
        let (guid, digest) = parse_upload_url("local://depot/sandboxes/abc/0123ff").unwrap();
        assert_eq!(guid, "abc");
        assert_eq!(digest, Digest::new("0123ff"));
        assert!(parse_upload_url("local://depot/nodes/web1").is_err());
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("http://d/sandboxes/g1/").unwrap(), "g1");
        assert!(last_segment("").is_err());
    }

    #[test]
    fn test_local_node_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let api = local_api(&tmp);

        assert!(api.load_node("web1").unwrap().is_none());
        api.create_node(&Node::new("web1")).unwrap();
        let node = api.load_node("web1").unwrap().unwrap();
        assert!(node.exists_remotely);
        api.update_node(&node).unwrap();
    }

    #[test]
    fn test_local_credentials() {
        let tmp = TempDir::new().unwrap();
        let mut api = local_api(&tmp);
        let client = api.register_client("web1").unwrap();

        api.use_credentials("web1", &client.private_key).unwrap();
        let err = api.use_credentials("web1", "nope").unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
    }
}
