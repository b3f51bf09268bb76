//! Sandbox commit: all-or-nothing promotion of staged files into the
//! content store.
//!
//! Files are moved one at a time. If any move fails, or the completed sandbox
//! cannot be saved, every move already made by this commit is reversed in
//! reverse order and the digests it recorded are forgotten, so the content
//! store ends up as it was before the attempt. Commits hold a store-wide lock
//! from the first check to the final save.

use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxManager};
use manifest::Digest;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Moves one file. Swappable so tests can inject failures.
pub trait FileMover: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Plain `fs::rename`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMover;

impl FileMover for FsMover {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// A move that has been made and can be undone.
#[derive(Debug)]
struct Promoted {
    digest: Digest,
    staged: PathBuf,
    stored: PathBuf,
}

impl SandboxManager {
    /// Update a sandbox, committing its files when `completed` is set.
    ///
    /// Fails `BadRequest` if the sandbox is already complete or any declared
    /// digest has neither a staged file nor a copy in the content store.
    pub fn commit(&self, guid: &str, completed: bool) -> Result<Sandbox> {
        let _guard = self.lock_commits();

        let mut sandbox = self.load(guid)?;
        if sandbox.is_completed {
            return Err(Error::bad_request(format!(
                "cannot update sandbox {guid}: already complete"
            )));
        }

        if !completed {
            self.save(&sandbox)?;
            return Ok(sandbox);
        }

        let mut missing: Vec<&Digest> = Vec::new();
        for digest in &sandbox.checksums {
            if !self.staged_path(guid, digest).is_file() && !self.content.contains(digest)? {
                missing.push(digest);
            }
        }
        if !missing.is_empty() {
            let list: Vec<&str> = missing.iter().map(|d| d.as_str()).collect();
            return Err(Error::bad_request(format!(
                "cannot update sandbox {guid}: checksums not uploaded: {}",
                list.join(", ")
            )));
        }

        let done = self.promote_all(&sandbox)?;
        sandbox.is_completed = true;
        if let Err(e) = self.save(&sandbox) {
            log::error!(
                "Could not save completed sandbox {guid}: {e}; rolling back {} file(s)",
                done.len()
            );
            self.roll_back(done);
            return Err(e);
        }
        Ok(sandbox)
    }

    fn promote_all(&self, sandbox: &Sandbox) -> Result<Vec<Promoted>> {
        let mut done: Vec<Promoted> = Vec::with_capacity(sandbox.checksums.len());

        for digest in &sandbox.checksums {
            match self.promote(&sandbox.guid, digest) {
                Ok(Some(step)) => done.push(step),
                Ok(None) => {}
                Err(e) => {
                    log::error!(
                        "Commit of sandbox {} failed at {digest}: {e}; rolling back {} file(s)",
                        sandbox.guid,
                        done.len()
                    );
                    self.roll_back(done);
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Move one staged file into the store and record it.
    ///
    /// Returns `None` when another sandbox already committed the digest.
    fn promote(&self, guid: &str, digest: &Digest) -> Result<Option<Promoted>> {
        if self.content.contains(digest)? {
            log::debug!("{digest} already committed, leaving staged copy in {guid}");
            return Ok(None);
        }

        let staged = self.staged_path(guid, digest);
        let stored = self.content.location(digest, true)?;

        log::info!("Moving {} to {}", staged.display(), stored.display());
        self.mover
            .rename(&staged, &stored)
            .map_err(|e| Error::io(&staged, e))?;

        let step = Promoted {
            digest: digest.clone(),
            staged,
            stored,
        };

        if let Err(e) = self.content.record(digest) {
            self.undo(&step);
            return Err(e);
        }
        Ok(Some(step))
    }

    fn roll_back(&self, done: Vec<Promoted>) {
        for step in done.iter().rev() {
            self.undo(step);
        }
    }

    fn undo(&self, step: &Promoted) {
        log::warn!(
            "Moving {} back to {}",
            step.stored.display(),
            step.staged.display()
        );
        if let Err(e) = self.mover.rename(&step.stored, &step.staged) {
            log::error!("Could not restore {}: {e}", step.staged.display());
        }
        match self.content.forget(&step.digest) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => log::error!("Could not forget {}: {e}", step.digest),
        }
    }
}
