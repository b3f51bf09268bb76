//! Sandboxes: server-side staging for file content not yet in the store.
//!
//! A client announces the digests it wants to publish, learns which ones the
//! depot already has, uploads the rest into the sandbox's staging directory,
//! and finally commits the sandbox (see [`finalize`](crate::finalize)).

use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::finalize::{FileMover, FsMover};
use crate::store::{DocumentStore, DocumentStoreExt};
use crate::urls::UrlGenerator;
use chrono::{DateTime, Utc};
use manifest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Document kind for sandbox records.
pub const SANDBOX_KIND: &str = "sandbox";

/// A staging area for one upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub guid: String,
    /// Digests the depot did not know when the sandbox was created
    pub checksums: BTreeSet<Digest>,
    /// Terminal once true
    pub is_completed: bool,
    pub create_time: DateTime<Utc>,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            guid: Uuid::new_v4().simple().to_string(),
            checksums: BTreeSet::new(),
            is_completed: false,
            create_time: Utc::now(),
        }
    }
}

/// Per-digest answer to a sandbox creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumDecision {
    pub needs_upload: bool,
    /// Upload target, present only when `needs_upload`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Creates sandboxes, accepts uploads, and commits them into the store.
pub struct SandboxManager {
    pub(crate) docs: Arc<dyn DocumentStore>,
    pub(crate) content: ContentStore,
    staging_root: PathBuf,
    urls: Arc<dyn UrlGenerator>,
    verify_uploads: bool,
    pub(crate) mover: Arc<dyn FileMover>,
    commit_lock: Mutex<()>,
}

impl SandboxManager {
    /// Manager staging uploads below `staging_root`.
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        content: ContentStore,
        staging_root: impl Into<PathBuf>,
        urls: Arc<dyn UrlGenerator>,
    ) -> Self {
        Self {
            docs,
            content,
            staging_root: staging_root.into(),
            urls,
            verify_uploads: false,
            mover: Arc::new(FsMover),
            commit_lock: Mutex::new(()),
        }
    }

    /// Reject uploads whose bytes do not hash to the declared digest.
    pub fn with_verify_uploads(mut self, verify: bool) -> Self {
        self.verify_uploads = verify;
        self
    }

    /// Replace the filesystem mover used during commit.
    pub fn with_mover(mut self, mover: Arc<dyn FileMover>) -> Self {
        self.mover = mover;
        self
    }

    /// The content store commits land in.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Open a sandbox for the given digests.
    ///
    /// Digests already in the content store are answered with
    /// `needs_upload = false`; every other digest joins the sandbox and gets
    /// an upload URL.
    pub fn create(
        &self,
        requested: &BTreeSet<Digest>,
    ) -> Result<(Sandbox, BTreeMap<Digest, ChecksumDecision>)> {
        if let Some(bad) = requested.iter().find(|d| !d.is_well_formed()) {
            return Err(Error::bad_request(format!("malformed checksum {bad}")));
        }

        let known = self.content.known_digests()?;
        let mut sandbox = Sandbox::new();
        let mut decisions = BTreeMap::new();

        for digest in requested {
            let decision = if known.contains(digest) {
                ChecksumDecision {
                    needs_upload: false,
                    url: None,
                }
            } else {
                sandbox.checksums.insert(digest.clone());
                ChecksumDecision {
                    needs_upload: true,
                    url: Some(self.urls.sandbox_checksum(&sandbox.guid, digest)),
                }
            };
            decisions.insert(digest.clone(), decision);
        }

        let dir = self.sandbox_dir(&sandbox.guid);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        self.save(&sandbox)?;

        log::info!(
            "Created sandbox {} ({} of {} checksums need upload)",
            sandbox.guid,
            sandbox.checksums.len(),
            requested.len()
        );
        Ok((sandbox, decisions))
    }

    /// Load a sandbox record.
    pub fn load(&self, guid: &str) -> Result<Sandbox> {
        self.docs.load_as(SANDBOX_KIND, guid)
    }

    /// Every sandbox guid with its URL.
    pub fn list(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .docs
            .list(SANDBOX_KIND)?
            .into_iter()
            .map(|guid| {
                let url = self.urls.sandbox(&guid);
                (guid, url)
            })
            .collect())
    }

    /// Stage the bytes for one declared digest.
    ///
    /// A repeated upload for the same digest replaces the earlier one. Unless
    /// upload verification is enabled the bytes are trusted as given.
    pub fn upload_checksum(&self, guid: &str, digest: &Digest, body: &mut dyn Read) -> Result<String> {
        let sandbox = self.load(guid)?;

        if sandbox.is_completed {
            return Err(Error::bad_request(format!(
                "cannot upload to sandbox {guid}: already complete"
            )));
        }
        if !sandbox.checksums.contains(digest) {
            return Err(Error::bad_request(format!(
                "checksum {digest} isn't a part of sandbox {guid}"
            )));
        }

        let dest = self.staged_path(guid, digest);
        let partial = self
            .sandbox_dir(guid)
            .join(format!(".{digest}.{}.partial", Uuid::new_v4().simple()));

        write_all(&partial, body)?;

        if self.verify_uploads {
            let actual = Digest::of_file(&partial)?;
            if &actual != digest {
                let _ = fs::remove_file(&partial);
                return Err(Error::bad_request(format!(
                    "uploaded content for {digest} hashes to {actual}"
                )));
            }
        }

        fs::rename(&partial, &dest).map_err(|e| Error::io(&dest, e))?;
        log::info!("upload_checksum: staged {} for sandbox {guid}", dest.display());

        Ok(self.urls.sandbox_checksum(guid, digest))
    }

    pub(crate) fn save(&self, sandbox: &Sandbox) -> Result<()> {
        self.docs.store_as(SANDBOX_KIND, &sandbox.guid, sandbox)
    }

    pub(crate) fn sandbox_dir(&self, guid: &str) -> PathBuf {
        self.staging_root.join(guid)
    }

    pub(crate) fn staged_path(&self, guid: &str, digest: &Digest) -> PathBuf {
        self.sandbox_dir(guid).join(digest.as_str())
    }

    /// Held for the whole of a commit. Commits of every sandbox are
    /// serialized, so one commit's rollback never touches a digest another
    /// commit counted as present.
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_all(path: &Path, body: &mut dyn Read) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    io::copy(body, &mut file).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::urls::BaseUrl;
    use tempfile::TempDir;

    pub(crate) fn manager(tmp: &TempDir) -> SandboxManager {
        let docs: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let content = ContentStore::new(tmp.path().join("checksums"), docs.clone());
        SandboxManager::new(
            docs,
            content,
            tmp.path().join("sandboxes"),
            Arc::new(BaseUrl::new("http://depot")),
        )
    }

    pub(crate) fn digests(contents: &[&str]) -> BTreeSet<Digest> {
        contents.iter().map(|c| Digest::of_bytes(c.as_bytes())).collect()
    }

    #[test]
    fn test_create_marks_only_unknown_digests() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let known = Digest::of_bytes(b"known");
        mgr.content().record(&known).unwrap();

        let requested = digests(&["known", "new1", "new2"]);
        let (sandbox, decisions) = mgr.create(&requested).unwrap();

        for digest in &requested {
            let decision = &decisions[digest];
            assert_eq!(decision.needs_upload, digest != &known);
            assert_eq!(decision.url.is_some(), decision.needs_upload);
        }
        assert_eq!(sandbox.checksums.len(), 2);
        assert!(!sandbox.checksums.contains(&known));
        assert!(mgr.sandbox_dir(&sandbox.guid).is_dir());
        assert_eq!(mgr.load(&sandbox.guid).unwrap(), sandbox);
    }

    #[test]
    fn test_upload_url_is_addressed_by_guid_and_digest() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (sandbox, decisions) = mgr.create(&digests(&["a"])).unwrap();
        let digest = Digest::of_bytes(b"a");

        assert_eq!(
            decisions[&digest].url.as_deref().unwrap(),
            format!("http://depot/sandboxes/{}/{digest}", sandbox.guid)
        );
    }

    #[test]
    fn test_upload_undeclared_digest_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (sandbox, _) = mgr.create(&digests(&["a"])).unwrap();

        let stray = Digest::of_bytes(b"stray");
        let err = mgr
            .upload_checksum(&sandbox.guid, &stray, &mut &b"stray"[..])
            .unwrap_err();

        assert_eq!(err.status_code(), 400);
        assert!(!mgr.staged_path(&sandbox.guid, &stray).exists());
        assert!(mgr.content().known_digests().unwrap().is_empty());
    }

    #[test]
    fn test_upload_unknown_sandbox_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let err = mgr
            .upload_checksum("nope", &Digest::of_bytes(b"a"), &mut &b"a"[..])
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_upload_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (sandbox, _) = mgr.create(&digests(&["a"])).unwrap();
        let digest = Digest::of_bytes(b"a");

        mgr.upload_checksum(&sandbox.guid, &digest, &mut &b"first"[..])
            .unwrap();
        mgr.upload_checksum(&sandbox.guid, &digest, &mut &b"a"[..])
            .unwrap();

        let staged = fs::read(mgr.staged_path(&sandbox.guid, &digest)).unwrap();
        assert_eq!(staged, b"a");
    }

    #[test]
    fn test_upload_is_not_verified_by_default() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (sandbox, _) = mgr.create(&digests(&["a"])).unwrap();
        let digest = Digest::of_bytes(b"a");

        mgr.upload_checksum(&sandbox.guid, &digest, &mut &b"not a"[..])
            .unwrap();
        assert!(mgr.staged_path(&sandbox.guid, &digest).exists());
    }

    #[test]
    fn test_upload_verification_rejects_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).with_verify_uploads(true);
        let (sandbox, _) = mgr.create(&digests(&["a"])).unwrap();
        let digest = Digest::of_bytes(b"a");

        let err = mgr
            .upload_checksum(&sandbox.guid, &digest, &mut &b"not a"[..])
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(!mgr.staged_path(&sandbox.guid, &digest).exists());
        assert_eq!(fs::read_dir(mgr.sandbox_dir(&sandbox.guid)).unwrap().count(), 0);
    }

    #[test]
    fn test_create_rejects_malformed_digest() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let requested: BTreeSet<Digest> = [Digest::new("../etc")].into_iter().collect();
        assert_eq!(mgr.create(&requested).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_list_sandboxes() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (sandbox, _) = mgr.create(&digests(&["a"])).unwrap();
        let listed = mgr.list().unwrap();
        assert_eq!(
            listed[&sandbox.guid],
            format!("http://depot/sandboxes/{}", sandbox.guid)
        );
    }
}
