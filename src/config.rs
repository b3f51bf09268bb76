//! Client configuration (`client.toml`).
//!
//! ```toml
//! node_name = "web1.example.com"
//! server_url = "http://depot.example.com:4000"
//! file_cache_path = "~/.local/state/pantry/cache"
//! cookbook_path = ["~/cookbooks"]
//! sync_jobs = 4
//!
//! [retry]
//! kind = "exponential"
//! max_retries = 5
//! scale_secs = 1.0
//!
//! [handlers]
//! log = true
//! json_report_dir = "~/.local/state/pantry/reports"
//! ```
//!
//! Every key is optional. Path values may use `~` and environment variables.

use crate::error::{Error, Result};
use crate::paths;
use backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Report/exception handler switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Log a one-line summary after every run
    pub log: bool,
    /// Write a JSON report per run into this directory
    pub json_report_dir: Option<String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            log: true,
            json_report_dir: None,
        }
    }
}

/// Everything a client run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Node identity; derived from facts when unset
    pub node_name: Option<String>,
    /// Depot base URL for HTTP transport
    pub server_url: Option<String>,
    /// Local depot directory, used instead of `server_url` when set
    pub repository: Option<String>,
    /// Where the client credential lives
    pub client_key: String,
    /// Local file cache root
    pub file_cache_path: String,
    /// Cookbook directories for solo runs
    pub cookbook_path: Vec<String>,
    pub solo: bool,
    /// JSON attributes file applied to the node on every run
    pub json_attribs: Option<String>,
    /// Parallel file fetches during cache sync
    pub sync_jobs: usize,
    pub retry: BackoffPolicy,
    pub handlers: HandlerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            server_url: None,
            repository: None,
            client_key: default_path(paths::config_dir(), "client.key", "~/.config/pantry/client.key"),
            file_cache_path: default_path(paths::state_dir(), "cache", "~/.local/state/pantry/cache"),
            cookbook_path: Vec::new(),
            solo: false,
            json_attribs: None,
            sync_jobs: 1,
            retry: BackoffPolicy::default(),
            handlers: HandlerConfig::default(),
        }
    }
}

fn default_path(base: Result<PathBuf>, name: &str, fallback: &str) -> String {
    base.map(|dir| dir.join(name).to_string_lossy().to_string())
        .unwrap_or_else(|_| fallback.to_string())
}

impl ClientConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_file()?,
        };

        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Self::parse(&content).map_err(|source| Error::Toml { path, source })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn client_key_path(&self) -> PathBuf {
        paths::expand(&self.client_key)
    }

    pub fn file_cache_dir(&self) -> PathBuf {
        paths::expand(&self.file_cache_path)
    }

    pub fn repository_dir(&self) -> Option<PathBuf> {
        self.repository.as_deref().map(paths::expand)
    }

    pub fn cookbook_dirs(&self) -> Vec<PathBuf> {
        self.cookbook_path.iter().map(|p| paths::expand(p)).collect()
    }

    pub fn json_attribs_path(&self) -> Option<PathBuf> {
        self.json_attribs.as_deref().map(paths::expand)
    }

    pub fn json_report_dir(&self) -> Option<PathBuf> {
        self.handlers.json_report_dir.as_deref().map(paths::expand)
    }

    /// Client name used for registration: the configured node name.
    pub fn client_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Fail early on settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.sync_jobs == 0 {
            return Err(Error::config("sync_jobs must be at least 1"));
        }
        if !self.solo && self.server_url.is_none() && self.repository.is_none() {
            return Err(Error::config(
                "either server_url or repository must be set unless running solo",
            ));
        }
        Ok(())
    }
}
