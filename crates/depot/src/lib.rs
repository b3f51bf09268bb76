//! # depot
//!
//! Server side of cookbook distribution.
//!
//! - [`SandboxManager`] stages uploads of content the depot does not have yet
//! - [`SandboxManager::commit`] promotes a sandbox into the [`ContentStore`]
//!   all-or-nothing, rolling back on any failed move
//! - [`CookbookServer`] exposes sandbox, cookbook, node, role and client
//!   operations over a [`DocumentStore`]
//!
//! ## Example
//!
//! ```no_run
//! use depot::{CreateSandboxRequest, DepotConfig, UpdateSandboxRequest};
//! use manifest::Digest;
//!
//! let server = DepotConfig::new("/srv/depot").open().unwrap();
//! let digest = Digest::of_bytes(b"hello");
//! let created = server.create_sandbox(&CreateSandboxRequest::new([digest.clone()])).unwrap();
//! let guid = created.uri.rsplit('/').next().unwrap();
//! server.upload_checksum(guid, &digest, &mut &b"hello"[..]).unwrap();
//! server.update_sandbox(guid, &UpdateSandboxRequest { is_completed: true }).unwrap();
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod finalize;
pub mod node;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod urls;

pub use config::DepotConfig;
pub use content::ContentStore;
pub use error::{Error, ErrorCategory, Result};
pub use finalize::{FileMover, FsMover};
pub use node::{Node, Role, RunListItem, expand_run_list, merge_value};
pub use sandbox::{ChecksumDecision, Sandbox, SandboxManager};
pub use server::{
    ApiClient, CookbookServer, CreateSandboxRequest, CreateSandboxResponse, LATEST,
    UpdateSandboxRequest, UriResponse,
};
pub use store::{DocumentStore, DocumentStoreExt, MemoryStore, SqliteStore};
pub use urls::{BaseUrl, UrlGenerator};
