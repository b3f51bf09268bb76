//! The permanent content-addressed file store.
//!
//! Bytes live on disk at `{root}/{first two hex chars}/{digest}`; the set of
//! digests that are durably committed is tracked as `checksum` documents.
//! A digest is only "known" once its document exists, so a file that was
//! moved into place but never recorded does not count.

use crate::error::{Error, Result};
use crate::store::{DocumentStore, DocumentStoreExt};
use chrono::{DateTime, Utc};
use manifest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Document kind for committed digests.
pub const CHECKSUM_KIND: &str = "checksum";

/// Record of a committed digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub checksum: Digest,
    pub create_time: DateTime<Utc>,
}

/// Append-only mapping from digest to immutable bytes.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    docs: Arc<dyn DocumentStore>,
}

impl ContentStore {
    /// Content store with files under `root`.
    pub fn new(root: impl Into<PathBuf>, docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            root: root.into(),
            docs,
        }
    }

    /// Root directory of the file tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a digest has been committed.
    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        self.docs.exists(CHECKSUM_KIND, digest.as_str())
    }

    /// Every committed digest.
    pub fn known_digests(&self) -> Result<BTreeSet<Digest>> {
        Ok(self
            .docs
            .list(CHECKSUM_KIND)?
            .into_iter()
            .map(Digest::new)
            .collect())
    }

    /// Where a digest's bytes live, optionally creating the parent directory.
    pub fn location(&self, digest: &Digest, create_dirs: bool) -> Result<PathBuf> {
        if !digest.is_well_formed() {
            return Err(Error::bad_request(format!("malformed checksum {digest}")));
        }
        let prefix: String = digest.as_str().chars().take(2).collect();
        let dir = self.root.join(prefix);
        if create_dirs {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(dir.join(digest.as_str()))
    }

    /// Durably mark a digest as committed.
    pub fn record(&self, digest: &Digest) -> Result<()> {
        self.docs.store_as(
            CHECKSUM_KIND,
            digest.as_str(),
            &ChecksumRecord {
                checksum: digest.clone(),
                create_time: Utc::now(),
            },
        )
    }

    /// Undo [`record`](Self::record).
    pub fn forget(&self, digest: &Digest) -> Result<()> {
        self.docs.delete(CHECKSUM_KIND, digest.as_str())
    }

    /// Read the bytes of a committed digest.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        if !self.contains(digest)? {
            return Err(Error::not_found("checksum", digest.as_str()));
        }
        let path = self.location(digest, false)?;
        fs::read(&path).map_err(|e| Error::io(path, e))
    }
}
