//! Error types for depot operations.
//!
//! Errors are categorized so the transport layer can pick a response status
//! and callers can tell a missing record from a malformed request.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of depot errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Credential or signature failure
    Unauthorized,
    /// Missing/malformed parameter, undeclared digest, completed sandbox
    BadRequest,
    /// Unknown sandbox, node, cookbook, role, or client
    NotFound,
    /// Record already exists
    Conflict,
    /// Filesystem or storage failure
    Internal,
}

impl ErrorCategory {
    /// Response status a transport should use for this category.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
        }
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::BadRequest => "Bad request",
            Self::NotFound => "Not found",
            Self::Conflict => "Conflict",
            Self::Internal => "Internal error",
        }
    }
}

/// Errors that can occur during depot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Request could not be authenticated
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Request is malformed or not allowed in the current state
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Named record does not exist
    #[error("cannot find {kind} {name}")]
    NotFound {
        /// Record kind, e.g. "sandbox", "node"
        kind: String,
        /// Key that was looked up
        name: String,
    },

    /// Record already exists
    #[error("{kind} {name} already exists")]
    Conflict { kind: String, name: String },

    /// Filesystem error on a specific path
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document database error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Document (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest or dependency error
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
}

impl Error {
    /// Shorthand for [`Error::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Attach a path to an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Unauthorized { .. } => ErrorCategory::Unauthorized,
            Error::BadRequest { .. } => ErrorCategory::BadRequest,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::Manifest(e) if e.is_not_found() => ErrorCategory::NotFound,
            _ => ErrorCategory::Internal,
        }
    }

    /// Response status a transport should use for this error.
    pub fn status_code(&self) -> u16 {
        self.category().status_code()
    }

    /// Whether this error means the record does not exist.
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

/// Result type for depot operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::bad_request("x").status_code(), 400);
        assert_eq!(Error::not_found("sandbox", "abc").status_code(), 404);
        assert_eq!(
            Error::Unauthorized {
                message: "bad signature".into()
            }
            .status_code(),
            401
        );
        assert_eq!(
            Error::io("/tmp/x", std::io::Error::other("boom")).status_code(),
            500
        );
    }

    #[test]
    fn test_missing_cookbook_dependency_is_not_found() {
        let err = Error::from(manifest::Error::CookbookNotFound("ruby".into()));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("sandbox", "abc123");
        assert_eq!(err.to_string(), "cannot find sandbox abc123");
    }
}
