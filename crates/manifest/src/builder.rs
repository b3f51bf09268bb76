//! Build manifests from cookbook files on disk.

use crate::error::{Error, Result};
use crate::manifest::CookbookManifest;
use crate::types::{CookbookMetadata, Digest, FileEntry, Segment};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Absolute file paths grouped by segment.
pub type SegmentFiles = BTreeMap<Segment, Vec<PathBuf>>;

/// Turns per-segment file lists into a [`CookbookManifest`].
///
/// # Example
///
/// ```no_run
/// use manifest::{ManifestBuilder, scan_cookbook};
/// use std::path::Path;
///
/// let root = Path::new("/srv/cookbooks/apache2");
/// let files = scan_cookbook(root)?;
/// let manifest = ManifestBuilder::new("apache2", root).build(&files, "0.9.1")?;
/// for (digest, source) in manifest.checksums() {
///     println!("{digest} <- {source:?}");
/// }
/// # Ok::<(), manifest::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    cookbook_name: String,
    root: PathBuf,
    metadata: Option<CookbookMetadata>,
}

impl ManifestBuilder {
    /// Builder for the cookbook rooted at `root`.
    pub fn new(cookbook_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            cookbook_name: cookbook_name.into(),
            root: root.into(),
            metadata: None,
        }
    }

    /// Attach metadata to embed in the manifest.
    pub fn with_metadata(mut self, metadata: CookbookMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Hash every listed file and produce the manifest.
    ///
    /// Directories are skipped. `files`/`templates` entries without a
    /// specificity directory are skipped with a debug log.
    pub fn build(&self, files: &SegmentFiles, version: &str) -> Result<CookbookManifest> {
        let mut manifest = CookbookManifest::new(&self.cookbook_name, version);
        if let Some(metadata) = &self.metadata {
            manifest.metadata = CookbookMetadata {
                version: version.to_string(),
                ..metadata.clone()
            };
        }

        for segment in Segment::ALL {
            let Some(paths) = files.get(&segment) else {
                continue;
            };

            for file in paths {
                if file.is_dir() {
                    continue;
                }

                let Some(mut entry) = self.describe(segment, file)? else {
                    continue;
                };
                entry.checksum = Digest::of_file(file)?;
                manifest.push_from_disk(segment, entry, file);
            }
        }

        log::debug!(
            "Built manifest for {} with {} files",
            manifest.full_name(),
            manifest.file_count()
        );
        Ok(manifest)
    }

    /// Derive name/path/specificity for one file, checksum left empty.
    fn describe(&self, segment: Segment, file: &Path) -> Result<Option<FileEntry>> {
        let relative = file
            .strip_prefix(&self.root)
            .map_err(|_| Error::OutsideCookbook {
                cookbook: self.cookbook_name.clone(),
                path: file.to_path_buf(),
            })?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let path = parts.join("/");

        let entry = |name: String, specificity: Option<String>| FileEntry {
            name,
            path: path.clone(),
            checksum: Digest::new(""),
            specificity,
            url: None,
        };

        if segment == Segment::RootFiles {
            return Ok(Some(entry(path.clone(), None)));
        }

        let in_segment = parts.first().map(String::as_str) == Some(segment.as_str());

        if segment.has_specificity() {
            if !in_segment || parts.len() < 3 {
                log::debug!(
                    "Skipping file {}, as it doesn't have a proper segment",
                    file.display()
                );
                return Ok(None);
            }
            return Ok(Some(entry(parts[2..].join("/"), Some(parts[1].clone()))));
        }

        if !in_segment || parts.len() < 2 {
            return Err(Error::OutsideCookbook {
                cookbook: self.cookbook_name.clone(),
                path: file.to_path_buf(),
            });
        }
        Ok(Some(entry(parts[1..].join("/"), None)))
    }
}

/// Bucket every file of a cookbook directory into its segment.
///
/// Files directly under the root are `root_files`; files under a known
/// segment directory belong to that segment; anything else (version control
/// directories, test fixtures, ...) is ignored.
pub fn scan_cookbook(root: &Path) -> Result<SegmentFiles> {
    if !root.is_dir() {
        return Err(Error::PathNotFound(root.to_path_buf()));
    }

    let mut files = SegmentFiles::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let mut components = relative.components();
        let first = components
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();

        let segment = if entry.depth() == 1 {
            Some(Segment::RootFiles)
        } else {
            Segment::from_dir_name(&first)
        };

        if let Some(segment) = segment {
            files
                .entry(segment)
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }

    Ok(files)
}

/// Scan a cookbook directory, read its metadata, and build its manifest.
pub fn build_from_dir(root: &Path) -> Result<CookbookManifest> {
    let metadata = CookbookMetadata::load(root)?;
    let files = scan_cookbook(root)?;
    let version = metadata.version.clone();
    ManifestBuilder::new(metadata.name.clone(), root)
        .with_metadata(metadata)
        .build(&files, &version)
}
