//! Depot configuration and on-disk layout.
//!
//! ```text
//! {root}/
//!   depot.db        document store
//!   checksums/      committed content, sharded by digest prefix
//!   sandboxes/      per-guid staging directories
//! ```

use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::sandbox::SandboxManager;
use crate::server::CookbookServer;
use crate::store::{DocumentStore, SqliteStore};
use crate::urls::{BaseUrl, UrlGenerator};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "local://depot";

/// Settings for one depot repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotConfig {
    /// Repository root directory
    pub root: PathBuf,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Hash uploads and reject those that do not match their declared digest
    #[serde(default)]
    pub verify_uploads: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl DepotConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_url: default_base_url(),
            verify_uploads: false,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("depot.db")
    }

    pub fn checksum_root(&self) -> PathBuf {
        self.root.join("checksums")
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.root.join("sandboxes")
    }

    /// Open (creating if needed) the repository and wire up a server.
    pub fn open(&self) -> Result<CookbookServer> {
        std::fs::create_dir_all(&self.root).map_err(|e| Error::io(&self.root, e))?;
        log::debug!("Opening depot at {}", self.root.display());

        let docs: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(&self.db_path())?);
        let urls: Arc<dyn UrlGenerator> = Arc::new(BaseUrl::new(&self.base_url));
        let content = ContentStore::new(self.checksum_root(), docs.clone());
        let sandboxes = SandboxManager::new(docs.clone(), content, self.sandbox_root(), urls.clone())
            .with_verify_uploads(self.verify_uploads);

        Ok(CookbookServer::new(docs, sandboxes, urls))
    }
}
