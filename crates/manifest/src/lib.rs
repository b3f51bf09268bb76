//! # Manifest
//!
//! Content-addressed cookbook manifests.
//!
//! This crate provides functionality to:
//! - Scan a cookbook directory and bucket its files into segments
//! - Compute BLAKE3 digests for every file and emit a [`CookbookManifest`]
//! - Render manifests with per-file download URLs
//! - Expand a run list into the transitive closure of required cookbooks
//!
//! ## Example
//!
//! ```no_run
//! use manifest::{build_from_dir, DependencyGraph};
//! use std::path::Path;
//!
//! let manifest = build_from_dir(Path::new("/srv/cookbooks/apache2"))?;
//! println!("{} files in {}", manifest.file_count(), manifest.full_name());
//!
//! let graph = DependencyGraph::from_metadata([&manifest.metadata]);
//! let needed = graph.expand(["apache2::mod_ssl"])?;
//! # Ok::<(), manifest::Error>(())
//! ```

mod builder;
mod error;
mod graph;
mod manifest;
mod types;

pub use builder::{ManifestBuilder, SegmentFiles, build_from_dir, scan_cookbook};
pub use error::{Error, Result};
pub use graph::{DependencyGraph, cookbook_of, recipe_of};
pub use manifest::CookbookManifest;
pub use types::{
    CookbookMetadata, Digest, FileEntry, Segment, compare_versions, default_version,
};
