//! Error types for delay generation.

use thiserror::Error;

/// Errors produced by a [`DelayGenerator`](crate::DelayGenerator).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Every delay in the sequence has been handed out
    #[error("no more delays available (retry limit of {max_retries} reached)")]
    Exhausted {
        /// Number of delays the generator was created with
        max_retries: u32,
    },
}

/// Result type for delay generation.
pub type Result<T> = std::result::Result<T, Error>;
