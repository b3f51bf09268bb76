//! Retry driver that consumes a [`DelayGenerator`].

use crate::generator::DelayGenerator;
use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    /// Whether this failure is transient.
    fn is_retryable(&self) -> bool;
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of a retry.
    ///
    /// # Arguments
    /// * `attempt` - Number of the retry about to happen (1-indexed)
    /// * `error` - The error that triggered the retry
    /// * `delay` - How long the caller will sleep first
    fn on_retry(&self, attempt: u32, error: &dyn Display, delay: Duration);
}

/// No-op callback.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _error: &dyn Display, _delay: Duration) {}
}

/// Callback that reports retries through the `log` facade.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, error: &dyn Display, delay: Duration) {
        log::warn!(
            "Retry #{attempt} after error: {error}, delaying {:.1}s",
            delay.as_secs_f64()
        );
    }
}

/// Execute an operation, retrying transient failures.
///
/// The operation runs once, then once more per delay the generator yields,
/// for as long as it keeps failing with a retryable error. Non-retryable
/// errors are returned immediately. When the generator is exhausted the
/// last error is returned.
pub fn with_retry<T, E, F>(
    mut generator: DelayGenerator,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Result<T, E>,
{
    let callback = callback.unwrap_or(&LogCallback);
    let mut retries = 0u32;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => match generator.next_delay() {
                Ok(delay) => {
                    retries += 1;
                    callback.on_retry(retries, &e, delay);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(_) => {
                    if retries > 0 {
                        log::error!("Failed again and reached retry limit: {e}");
                    }
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fmt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn instant(max: u32) -> DelayGenerator {
        DelayGenerator::uniform(max, Duration::ZERO)
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(instant(3), None, || Ok::<_, TestError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_non_retryable_error_runs_once() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(instant(3), None, || {
            attempts.set(attempts.get() + 1);
            Err(TestError::Fatal)
        });

        assert_eq!(result.unwrap_err(), TestError::Fatal);
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let attempts = Cell::new(0);
        let result = with_retry(instant(3), None, || {
            let current = attempts.get();
            attempts.set(current + 1);
            if current < 2 {
                Err(TestError::Transient)
            } else {
                Ok(current)
            }
        });

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(instant(3), None, || {
            attempts.set(attempts.get() + 1);
            Err(TestError::Transient)
        });

        assert_eq!(result.unwrap_err(), TestError::Transient);
        // one initial attempt plus one per delay
        assert_eq!(attempts.get(), 4);
    }

    #[test]
    fn test_callback_invoked_per_retry() {
        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: &dyn Display, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(count.clone());

        let _: Result<(), _> = with_retry(instant(2), Some(&callback), || {
            Err(TestError::Transient)
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
