//! Client error types.
//!
//! Errors are categorized so retry logic can tell transient transport
//! failures from everything else, and so the CLI can print useful advice.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failure (transient, retryable)
    Network,
    /// The server answered with an error status
    Server,
    /// Unknown node, cookbook, recipe or dependency
    NotFound,
    /// Bad or missing configuration (fatal)
    Configuration,
    /// Recipe compilation or evaluation failed
    Convergence,
    /// Local filesystem error
    Io,
    Other,
}

impl ErrorCategory {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::Server => "Server rejected the request",
            Self::NotFound => "Not found",
            Self::Configuration => "Configuration error",
            Self::Convergence => "Convergence failed",
            Self::Io => "Filesystem error",
            Self::Other => "Unexpected error",
        }
    }

    /// Actionable advice for this category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check that the server is reachable and try again",
            Self::Server => "Check the server logs for details",
            Self::NotFound => "Verify the run list and that every cookbook is uploaded",
            Self::Configuration => "Check client.toml and the command-line flags",
            Self::Convergence => "Fix the failing recipe and run again",
            Self::Io => "Check permissions on the cache and cookbook directories",
            Self::Other => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during a client run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration is missing or inconsistent
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request never got a response
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    /// Server answered with an error status
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Recipe compilation or evaluation failed
    #[error("convergence failed: {0}")]
    Convergence(String),

    /// A run list names a recipe no available cookbook provides
    #[error("cannot find recipe {0}")]
    RecipeNotFound(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Depot(#[from] depot::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network { .. } => ErrorCategory::Network,
            Error::Server { status: 404, .. } => ErrorCategory::NotFound,
            Error::Server { .. } => ErrorCategory::Server,
            Error::Configuration(_) | Error::Toml { .. } => ErrorCategory::Configuration,
            Error::Convergence(_) => ErrorCategory::Convergence,
            Error::RecipeNotFound(_) => ErrorCategory::NotFound,
            Error::Io { .. } => ErrorCategory::Io,
            Error::Depot(e) if e.is_not_found() => ErrorCategory::NotFound,
            Error::Depot(_) => ErrorCategory::Server,
            Error::Manifest(e) if e.is_not_found() => ErrorCategory::NotFound,
            Error::Manifest(_) | Error::Json(_) => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// Re-label a failure as a network error for `url`, keeping network
    /// errors as they are.
    pub fn into_network(self, url: &str) -> Self {
        match self {
            Error::Network { .. } => self,
            other => Error::network(url, other.to_string()),
        }
    }
}

impl backoff::Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => Self::Server {
                status,
                message: format!("HTTP {status}"),
            },
            other => Self::Network {
                url: String::new(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        assert!(Error::network("http://x", "reset").is_retryable());
        assert!(
            !Error::Server {
                status: 500,
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(!Error::config("no node name").is_retryable());
        assert!(!Error::Convergence("bad recipe".into()).is_retryable());
    }

    #[test]
    fn test_not_found_across_layers() {
        assert!(
            Error::Server {
                status: 404,
                message: "HTTP 404".into()
            }
            .is_not_found()
        );
        assert!(Error::from(depot::Error::not_found("node", "web1")).is_not_found());
        assert!(Error::from(manifest::Error::CookbookNotFound("x".into())).is_not_found());
    }

    #[test]
    fn test_into_network() {
        let err = Error::from(depot::Error::not_found("checksum", "abc")).into_network("local://f");
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.to_string().contains("local://f"));
    }
}
