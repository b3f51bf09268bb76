//! Data types for the manifest crate

use crate::error::{Error, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// BLAKE3 content hash, hex encoded.
///
/// Two files with identical bytes always share one digest, which makes the
/// digest the primary key of the content store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap an already computed hex digest.
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hash an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Hash a file from disk.
    pub fn of_file(path: &Path) -> Result<Self> {
        hash_file(path)
            .map(Self)
            .map_err(|source| Error::HashFailed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like a digest we could have produced.
    ///
    /// Digests end up in filesystem paths, so anything other than
    /// lowercase hex is refused before it gets there.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Hash a file using BLAKE3
fn hash_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Hasher::new();

    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// A category of files within a cookbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Resources,
    Providers,
    Recipes,
    Definitions,
    Libraries,
    Attributes,
    Files,
    Templates,
    RootFiles,
}

impl Segment {
    /// Every segment, in manifest order.
    pub const ALL: [Segment; 9] = [
        Segment::Resources,
        Segment::Providers,
        Segment::Recipes,
        Segment::Definitions,
        Segment::Libraries,
        Segment::Attributes,
        Segment::Files,
        Segment::Templates,
        Segment::RootFiles,
    ];

    /// Directory / wire name of this segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Resources => "resources",
            Segment::Providers => "providers",
            Segment::Recipes => "recipes",
            Segment::Definitions => "definitions",
            Segment::Libraries => "libraries",
            Segment::Attributes => "attributes",
            Segment::Files => "files",
            Segment::Templates => "templates",
            Segment::RootFiles => "root_files",
        }
    }

    /// Whether files in this segment carry a specificity directory.
    pub fn has_specificity(&self) -> bool {
        matches!(self, Segment::Files | Segment::Templates)
    }

    /// The segment a top-level cookbook directory maps to, if any.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| *s != Segment::RootFiles && s.as_str() == name)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|seg| seg.as_str() == s)
            .ok_or_else(|| Error::InvalidSegment(s.to_string()))
    }
}

/// One file within a manifest segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name below the segment (and specificity) directory
    pub name: String,
    /// Path relative to the cookbook root, `/` separated
    pub path: String,
    /// Content digest
    pub checksum: Digest,
    /// Override scope for `files` and `templates` (e.g. "default", "ubuntu")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specificity: Option<String>,
    /// Download location, present only on manifests rendered with URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Cookbook metadata as found in `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookbookMetadata {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Dependency name → version constraint
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// Version used when a cookbook carries no metadata.
pub fn default_version() -> String {
    "0.0.0".to_string()
}

impl CookbookMetadata {
    /// Metadata for a cookbook with no `metadata.json`.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            ..Default::default()
        }
    }

    /// Read `metadata.json` from a cookbook directory.
    ///
    /// A missing file yields [`bare`](Self::bare) metadata named after the
    /// directory.
    pub fn load(cookbook_root: &Path) -> Result<Self> {
        let dir_name = cookbook_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = cookbook_root.join("metadata.json");

        if !path.exists() {
            log::debug!("No metadata.json in {}, using defaults", cookbook_root.display());
            return Ok(Self::bare(dir_name));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut metadata: Self = serde_json::from_str(&content)
            .map_err(|source| Error::InvalidMetadata { path, source })?;
        if metadata.name.is_empty() {
            metadata.name = dir_name;
        }
        Ok(metadata)
    }

    /// Declare a dependency.
    pub fn depends(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), constraint.into());
        self
    }
}

/// Compare two dotted versions numerically, field by field.
///
/// Non-numeric fields compare as zero, missing fields as zero, so
/// `"1.10.0" > "1.9.3"` and `"2" == "2.0.0"`.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}
