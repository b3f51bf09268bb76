//! The cookbook manifest: per-segment file listings keyed by digest.

use crate::types::{CookbookMetadata, Digest, FileEntry, Segment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Structured listing of one cookbook version's files.
///
/// Every [`Digest`] referenced here must exist in the content store once
/// the cookbook is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookbookManifest {
    /// Cookbook name, e.g. `apache2`
    pub cookbook_name: String,
    /// Cookbook version, e.g. `0.9.1`
    pub version: String,
    /// Full identity, `name-version`
    pub name: String,
    #[serde(default)]
    pub metadata: CookbookMetadata,
    #[serde(default)]
    pub segments: BTreeMap<Segment, Vec<FileEntry>>,
    /// On-disk origin of each digest; only populated by the builder
    #[serde(skip)]
    sources: BTreeMap<Digest, PathBuf>,
}

impl CookbookManifest {
    /// Create an empty manifest.
    pub fn new(cookbook_name: impl Into<String>, version: impl Into<String>) -> Self {
        let cookbook_name = cookbook_name.into();
        let version = version.into();
        Self {
            name: full_name(&cookbook_name, &version),
            metadata: CookbookMetadata {
                name: cookbook_name.clone(),
                version: version.clone(),
                ..Default::default()
            },
            cookbook_name,
            version,
            segments: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }

    /// Adopt a manifest supplied from elsewhere (e.g. the document store).
    ///
    /// The digest view is derived from the supplied segments; nothing is
    /// read from disk, so every digest maps to an unknown source.
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        let mut manifest: Self = serde_json::from_value(value)?;
        manifest.sources.clear();
        Ok(manifest)
    }

    /// `name-version` identity.
    pub fn full_name(&self) -> String {
        full_name(&self.cookbook_name, &self.version)
    }

    /// Append a file to a segment.
    pub fn push(&mut self, segment: Segment, entry: FileEntry) {
        self.segments.entry(segment).or_default().push(entry);
    }

    /// Append a file and remember where its bytes live on disk.
    pub(crate) fn push_from_disk(&mut self, segment: Segment, entry: FileEntry, source: &Path) {
        self.sources
            .insert(entry.checksum.clone(), source.to_path_buf());
        self.push(segment, entry);
    }

    /// Files listed under one segment.
    pub fn files(&self, segment: Segment) -> &[FileEntry] {
        self.segments
            .get(&segment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every file in every segment, in manifest order.
    pub fn entries(&self) -> impl Iterator<Item = (Segment, &FileEntry)> {
        self.segments
            .iter()
            .flat_map(|(segment, files)| files.iter().map(move |f| (*segment, f)))
    }

    /// Digest → on-disk source path.
    ///
    /// Sources are only known for a manifest freshly built from disk; a
    /// manifest loaded from storage maps every digest to `None`.
    pub fn checksums(&self) -> BTreeMap<Digest, Option<PathBuf>> {
        self.entries()
            .map(|(_, f)| (f.checksum.clone(), self.sources.get(&f.checksum).cloned()))
            .collect()
    }

    /// The set of digests referenced anywhere in this manifest.
    pub fn digests(&self) -> BTreeSet<Digest> {
        self.entries().map(|(_, f)| f.checksum.clone()).collect()
    }

    /// Whether any file in this manifest has the given digest.
    pub fn references(&self, digest: &Digest) -> bool {
        self.entries().any(|(_, f)| &f.checksum == digest)
    }

    /// Total number of files.
    pub fn file_count(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    /// Copy of this manifest with a download URL on every file.
    ///
    /// `url_gen` receives `(cookbook_name, version, digest)`; routing is
    /// entirely the caller's concern.
    pub fn with_urls<F>(&self, url_gen: F) -> Self
    where
        F: Fn(&str, &str, &Digest) -> String,
    {
        let mut rendered = self.clone();
        for files in rendered.segments.values_mut() {
            for file in files.iter_mut() {
                file.url = Some(url_gen(&self.cookbook_name, &self.version, &file.checksum));
            }
        }
        rendered
    }
}

fn full_name(name: &str, version: &str) -> String {
    format!("{name}-{version}")
}
