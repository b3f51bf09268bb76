//! `CookbookServer`: the depot's request surface.
//!
//! Each method corresponds to one API operation. Transports (an HTTP router,
//! or the in-process client) translate requests into these calls and map
//! [`Error::status_code`](crate::Error::status_code) onto their own
//! responses.

use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::node::{NODE_KIND, Node, ROLE_KIND, Role, expand_run_list};
use crate::sandbox::{ChecksumDecision, Sandbox, SandboxManager};
use crate::store::{DocumentStore, DocumentStoreExt};
use crate::urls::UrlGenerator;
use chrono::{DateTime, Utc};
use manifest::{CookbookManifest, DependencyGraph, Digest, compare_versions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use uuid::Uuid;

/// Document kind for published cookbook manifests, keyed `name-version`.
pub const COOKBOOK_KIND: &str = "cookbook";
/// Document kind for registered API clients.
pub const CLIENT_KIND: &str = "client";

/// Version selector meaning "highest published version".
pub const LATEST: &str = "latest";

/// Body of a sandbox creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Digests to publish; values are ignored
    pub checksums: BTreeMap<Digest, Value>,
}

impl CreateSandboxRequest {
    pub fn new(digests: impl IntoIterator<Item = Digest>) -> Self {
        Self {
            checksums: digests.into_iter().map(|d| (d, Value::Null)).collect(),
        }
    }
}

/// Response to a sandbox creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    pub uri: String,
    pub checksums: BTreeMap<Digest, ChecksumDecision>,
}

/// Body of a sandbox update request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSandboxRequest {
    #[serde(default)]
    pub is_completed: bool,
}

/// Response carrying the location of a created or touched record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriResponse {
    pub uri: String,
}

/// A registered API client and its credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiClient {
    pub name: String,
    pub private_key: String,
    pub create_time: DateTime<Utc>,
}

/// The depot's API operations over a document store and content store.
pub struct CookbookServer {
    docs: Arc<dyn DocumentStore>,
    sandboxes: SandboxManager,
    urls: Arc<dyn UrlGenerator>,
}

impl CookbookServer {
    pub fn new(docs: Arc<dyn DocumentStore>, sandboxes: SandboxManager, urls: Arc<dyn UrlGenerator>) -> Self {
        Self {
            docs,
            sandboxes,
            urls,
        }
    }

    pub fn content(&self) -> &ContentStore {
        self.sandboxes.content()
    }

    pub fn urls(&self) -> &dyn UrlGenerator {
        self.urls.as_ref()
    }

    // ========================================================================
    // Sandboxes
    // ========================================================================

    /// Open a sandbox; the response tells which digests need uploading.
    pub fn create_sandbox(&self, request: &CreateSandboxRequest) -> Result<CreateSandboxResponse> {
        let requested: BTreeSet<Digest> = request.checksums.keys().cloned().collect();
        let (sandbox, checksums) = self.sandboxes.create(&requested)?;
        Ok(CreateSandboxResponse {
            uri: self.urls.sandbox(&sandbox.guid),
            checksums,
        })
    }

    pub fn sandbox(&self, guid: &str) -> Result<Sandbox> {
        self.sandboxes.load(guid)
    }

    /// Guid → URI of every sandbox.
    pub fn sandboxes(&self) -> Result<BTreeMap<String, String>> {
        self.sandboxes.list()
    }

    pub fn upload_checksum(&self, guid: &str, digest: &Digest, body: &mut dyn Read) -> Result<UriResponse> {
        let uri = self.sandboxes.upload_checksum(guid, digest, body)?;
        Ok(UriResponse { uri })
    }

    pub fn update_sandbox(&self, guid: &str, request: &UpdateSandboxRequest) -> Result<Sandbox> {
        self.sandboxes.commit(guid, request.is_completed)
    }

    // ========================================================================
    // Cookbooks
    // ========================================================================

    /// Publish a cookbook version.
    ///
    /// Every digest the manifest references must already be committed.
    pub fn store_cookbook(&self, manifest: &CookbookManifest) -> Result<UriResponse> {
        let known = self.content().known_digests()?;
        let missing: Vec<String> = manifest
            .digests()
            .into_iter()
            .filter(|d| !known.contains(d))
            .map(|d| d.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::bad_request(format!(
                "cookbook {} references unknown checksums: {}",
                manifest.full_name(),
                missing.join(", ")
            )));
        }

        // Stored without URLs; they are rendered per request.
        let mut stored = manifest.clone();
        for files in stored.segments.values_mut() {
            for file in files.iter_mut() {
                file.url = None;
            }
        }
        stored.name = manifest.full_name();

        self.docs.store_as(COOKBOOK_KIND, &stored.name, &stored)?;
        log::info!("Stored cookbook {}", stored.name);
        Ok(UriResponse {
            uri: format!("cookbooks/{}/{}", manifest.cookbook_name, manifest.version),
        })
    }

    /// Cookbook name → published versions, oldest first.
    pub fn cookbooks(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut versions = self.docs.view(COOKBOOK_KIND, |_, doc| {
            Some((
                doc.get("cookbook_name")?.as_str()?.to_string(),
                doc.get("version")?.as_str()?.to_string(),
            ))
        })?;
        for list in versions.values_mut() {
            list.sort_by(|a, b| compare_versions(a, b));
        }
        Ok(versions)
    }

    /// Highest published version of a cookbook.
    pub fn latest_version(&self, name: &str) -> Result<String> {
        self.cookbooks()?
            .remove(name)
            .and_then(|mut versions| versions.pop())
            .ok_or_else(|| Error::not_found(COOKBOOK_KIND, name))
    }

    /// Manifest of one version (or `latest`), with download URLs.
    pub fn cookbook_manifest(&self, name: &str, version: &str) -> Result<CookbookManifest> {
        let manifest = self.load_cookbook(name, version)?;
        Ok(self.render(&manifest))
    }

    /// Bytes of one file of a published cookbook.
    pub fn cookbook_file(&self, name: &str, version: &str, digest: &Digest) -> Result<Vec<u8>> {
        let manifest = self.load_cookbook(name, version)?;
        if !manifest.references(digest) {
            return Err(Error::not_found(
                "file",
                format!("{digest} in {}", manifest.full_name()),
            ));
        }
        self.content().read(digest)
    }

    /// Manifests of every cookbook a node's run list needs, latest versions.
    pub fn cookbooks_for_node(&self, node_name: &str) -> Result<BTreeMap<String, CookbookManifest>> {
        let node = self.node(node_name)?;
        let recipes = expand_run_list(&node.run_list, |role| self.role(role))?;

        let mut latest = BTreeMap::new();
        for name in self.cookbooks()?.keys() {
            let manifest = self.load_cookbook(name, LATEST)?;
            latest.insert(name.clone(), manifest);
        }

        let mut graph = DependencyGraph::new();
        for (name, manifest) in &latest {
            graph.insert(name.clone(), manifest.metadata.dependencies.clone());
        }
        let needed = graph.expand(&recipes)?;
        log::debug!("Node {node_name} needs cookbooks {needed:?}");

        Ok(needed
            .into_iter()
            .filter_map(|name| {
                let manifest = latest.remove(&name)?;
                Some((name, self.render(&manifest)))
            })
            .collect())
    }

    fn load_cookbook(&self, name: &str, version: &str) -> Result<CookbookManifest> {
        let version = if version == LATEST {
            self.latest_version(name)?
        } else {
            version.to_string()
        };
        let key = format!("{name}-{version}");
        let doc = self.docs.load(COOKBOOK_KIND, &key)?;
        Ok(CookbookManifest::from_value(doc)?)
    }

    fn render(&self, manifest: &CookbookManifest) -> CookbookManifest {
        manifest.with_urls(|name, version, digest| self.urls.cookbook_file(name, version, digest))
    }

    // ========================================================================
    // Nodes and roles
    // ========================================================================

    pub fn node(&self, name: &str) -> Result<Node> {
        let mut node: Node = self.docs.load_as(NODE_KIND, name)?;
        node.exists_remotely = true;
        Ok(node)
    }

    pub fn nodes(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .docs
            .list(NODE_KIND)?
            .into_iter()
            .map(|name| {
                let uri = self.urls.node(&name);
                (name, uri)
            })
            .collect())
    }

    /// Create a node record. Fails `Conflict` if it already exists.
    pub fn create_node(&self, node: &Node) -> Result<UriResponse> {
        if node.name.is_empty() {
            return Err(Error::bad_request("node name must not be empty"));
        }
        if self.docs.exists(NODE_KIND, &node.name)? {
            return Err(Error::Conflict {
                kind: NODE_KIND.into(),
                name: node.name.clone(),
            });
        }
        self.docs.store_as(NODE_KIND, &node.name, node)?;
        Ok(UriResponse {
            uri: self.urls.node(&node.name),
        })
    }

    /// Replace an existing node record.
    pub fn update_node(&self, name: &str, node: &Node) -> Result<Node> {
        if !self.docs.exists(NODE_KIND, name)? {
            return Err(Error::not_found(NODE_KIND, name));
        }
        if node.name != name {
            return Err(Error::bad_request(format!(
                "node name mismatch: {} in body, {name} in request",
                node.name
            )));
        }
        self.docs.store_as(NODE_KIND, name, node)?;
        self.node(name)
    }

    pub fn role(&self, name: &str) -> Result<Role> {
        self.docs.load_as(ROLE_KIND, name)
    }

    /// Insert or replace a role.
    pub fn store_role(&self, role: &Role) -> Result<()> {
        if role.name.is_empty() {
            return Err(Error::bad_request("role name must not be empty"));
        }
        self.docs.store_as(ROLE_KIND, &role.name, role)
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Issue a credential for a new client. Fails `Conflict` if registered.
    pub fn register_client(&self, name: &str) -> Result<ApiClient> {
        if name.is_empty() {
            return Err(Error::bad_request("client name must not be empty"));
        }
        if self.docs.exists(CLIENT_KIND, name)? {
            return Err(Error::Conflict {
                kind: CLIENT_KIND.into(),
                name: name.to_string(),
            });
        }
        let client = ApiClient {
            name: name.to_string(),
            private_key: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            create_time: Utc::now(),
        };
        self.docs.store_as(CLIENT_KIND, name, &client)?;
        log::info!("Registered client {name}");
        Ok(client)
    }

    /// Check a client's credential.
    pub fn authenticate(&self, name: &str, key: &str) -> Result<()> {
        let client: Option<ApiClient> = self.docs.load_optional(CLIENT_KIND, name)?;
        match client {
            Some(client) if client.private_key == key => Ok(()),
            _ => Err(Error::Unauthorized {
                message: format!("bad credentials for client {name}"),
            }),
        }
    }
}
