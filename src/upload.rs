//! Publishing cookbooks to a depot.
//!
//! A cookbook goes up in four steps: build its manifest, open a sandbox for
//! every digest it references, upload the files the depot asks for, then
//! commit the sandbox and store the manifest.

use crate::error::{Error, Result};
use crate::transport::ServerApi;
use depot::CreateSandboxRequest;
use manifest::build_from_dir;
use std::path::Path;

/// What one upload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub cookbook: String,
    pub version: String,
    /// Files sent to the depot
    pub uploaded: usize,
    /// Files the depot already had
    pub skipped: usize,
}

/// Publish the cookbook in `dir`.
pub fn upload_cookbook(api: &dyn ServerApi, dir: &Path) -> Result<UploadReport> {
    let manifest = build_from_dir(dir)?;
    log::info!(
        "Uploading {} ({} file(s))",
        manifest.full_name(),
        manifest.file_count()
    );

    let sources = manifest.checksums();
    let sandbox = api.create_sandbox(&CreateSandboxRequest::new(sources.keys().cloned()))?;

    let mut uploaded = 0;
    let mut skipped = 0;
    for (digest, decision) in &sandbox.checksums {
        if !decision.needs_upload {
            skipped += 1;
            continue;
        }
        let url = decision.url.as_deref().ok_or_else(|| Error::Server {
            status: 500,
            message: format!("sandbox gave no upload URL for {digest}"),
        })?;
        let path = sources
            .get(digest)
            .and_then(|source| source.as_ref())
            .ok_or_else(|| Error::config(format!("no local file for checksum {digest}")))?;

        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        log::debug!("Uploading {} as {digest}", path.display());
        api.upload_checksum(url, &bytes)?;
        uploaded += 1;
    }

    api.commit_sandbox(&sandbox.uri)?;
    api.store_cookbook(&manifest)?;

    Ok(UploadReport {
        cookbook: manifest.cookbook_name.clone(),
        version: manifest.version.clone(),
        uploaded,
        skipped,
    })
}
