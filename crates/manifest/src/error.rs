//! Error types for the manifest crate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building manifests or walking dependencies
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path does not exist
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Failed to hash file
    #[error("failed to hash file {}: {source}", .path.display())]
    HashFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not inside the cookbook it was listed for
    #[error("{} is not part of cookbook {cookbook}", .path.display())]
    OutsideCookbook { cookbook: String, path: PathBuf },

    /// Unknown segment name
    #[error("invalid segment {0}: must be one of resources, providers, recipes, definitions, libraries, attributes, files, templates, root_files")]
    InvalidSegment(String),

    /// No metadata known for a cookbook
    #[error("cookbook not found: {0}")]
    CookbookNotFound(String),

    /// Malformed metadata.json
    #[error("invalid metadata in {}: {source}", .path.display())]
    InvalidMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Whether this error means something named does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CookbookNotFound(_) | Self::PathNotFound(_))
    }
}

/// Result type for manifest operations
pub type Result<T> = std::result::Result<T, Error>;
