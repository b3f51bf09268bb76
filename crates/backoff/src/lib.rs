//! # Backoff
//!
//! Bounded delay sequences for retrying transient failures.
//!
//! A [`DelayGenerator`] holds a fixed, pre-computed queue of delays. Each
//! retry consumes one delay; once the queue is empty the generator reports
//! [`Error::Exhausted`] and the caller gives up. Two shapes are provided:
//!
//! - **Exponential**: attempt `i` waits a random duration in `[0, scale * 2^i)`
//! - **Uniform**: every attempt waits the same fixed delay
//!
//! [`with_retry`] drives an operation against a generator, re-running it
//! while the error is [`Retryable`] and delays remain.
//!
//! ## Example
//!
//! ```
//! use backoff::{DelayGenerator, with_retry, Retryable};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "flaky")
//!     }
//! }
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool { true }
//! }
//!
//! let mut calls = 0;
//! let result = with_retry(DelayGenerator::uniform(3, Duration::ZERO), None, || {
//!     calls += 1;
//!     if calls < 3 { Err(Flaky) } else { Ok(calls) }
//! });
//! assert_eq!(result.unwrap(), 3);
//! ```

mod error;
mod generator;
mod retry;

pub use error::{Error, Result};
pub use generator::{BackoffPolicy, DelayGenerator};
pub use retry::{LogCallback, NoCallback, RetryCallback, Retryable, with_retry};
