//! Delay generators and the serializable policy that builds them.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// A bounded, pre-computed sequence of retry delays.
///
/// The whole sequence is fixed at construction time, so the number of
/// retries a caller can perform is exactly [`max_retries`](Self::max_retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayGenerator {
    queue: VecDeque<Duration>,
    max_retries: u32,
}

impl DelayGenerator {
    /// Exponential backoff with random jitter.
    ///
    /// Delay `i` (0-indexed) is drawn uniformly from `[0, scale * 2^i)`.
    pub fn exponential(max_retries: u32, scale: Duration) -> Self {
        Self::exponential_with_rng(max_retries, scale, &mut rand::thread_rng())
    }

    /// Exponential backoff drawing jitter from the supplied RNG.
    pub fn exponential_with_rng<R: Rng + ?Sized>(
        max_retries: u32,
        scale: Duration,
        rng: &mut R,
    ) -> Self {
        let scale_ms = scale.as_millis() as u64;
        let queue = (0..max_retries)
            .map(|exp| {
                let upper = scale_ms.saturating_mul(1u64 << exp.min(62));
                if upper == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rng.gen_range(0..upper))
                }
            })
            .collect();

        Self { queue, max_retries }
    }

    /// Uniform backoff: `max_retries` copies of the same delay.
    pub fn uniform(max_retries: u32, delay: Duration) -> Self {
        Self {
            queue: (0..max_retries).map(|_| delay).collect(),
            max_retries,
        }
    }

    /// A generator that never allows a retry.
    pub fn none() -> Self {
        Self::uniform(0, Duration::ZERO)
    }

    /// Whether another delay is available.
    pub fn has_next(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Take the next delay, or report exhaustion.
    pub fn next_delay(&mut self) -> Result<Duration> {
        self.queue.pop_front().ok_or(Error::Exhausted {
            max_retries: self.max_retries,
        })
    }

    /// Number of delays not yet handed out.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Number of delays this generator was created with.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Iterator for DelayGenerator {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.queue.pop_front()
    }
}

/// Retry policy as it appears in configuration files.
///
/// ```toml
/// [retry]
/// kind = "exponential"
/// max_retries = 3
/// scale_secs = 1.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Random delay in `[0, scale * 2^attempt)`
    Exponential {
        max_retries: u32,
        #[serde(default = "default_scale_secs")]
        scale_secs: f64,
    },
    /// Fixed delay between attempts
    Uniform {
        max_retries: u32,
        #[serde(default = "default_scale_secs")]
        delay_secs: f64,
    },
    /// Never retry
    None,
}

fn default_scale_secs() -> f64 {
    1.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            max_retries: 3,
            scale_secs: default_scale_secs(),
        }
    }
}

impl BackoffPolicy {
    /// Build a fresh generator for one retried operation.
    pub fn generator(&self) -> DelayGenerator {
        match self {
            Self::Exponential {
                max_retries,
                scale_secs,
            } => DelayGenerator::exponential(*max_retries, secs(*scale_secs)),
            Self::Uniform {
                max_retries,
                delay_secs,
            } => DelayGenerator::uniform(*max_retries, secs(*delay_secs)),
            Self::None => DelayGenerator::none(),
        }
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_exponential_yields_max_retries_then_exhausts() {
        let mut generator = DelayGenerator::exponential(3, Duration::from_secs(1));

        assert!(generator.next_delay().is_ok());
        assert!(generator.next_delay().is_ok());
        assert!(generator.next_delay().is_ok());
        assert!(!generator.has_next());
        assert_eq!(
            generator.next_delay(),
            Err(Error::Exhausted { max_retries: 3 })
        );
    }

    #[test]
    fn test_exponential_delays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let scale = Duration::from_millis(100);
        let delays: Vec<_> = DelayGenerator::exponential_with_rng(5, scale, &mut rng).collect();

        assert_eq!(delays.len(), 5);
        for (exp, delay) in delays.iter().enumerate() {
            assert!(*delay < scale * (1 << exp));
        }
    }

    #[test]
    fn test_exponential_zero_scale_is_zero_delay() {
        let delays: Vec<_> = DelayGenerator::exponential(2, Duration::ZERO).collect();
        assert_eq!(delays, vec![Duration::ZERO, Duration::ZERO]);
    }

    #[test]
    fn test_uniform_yields_identical_values() {
        let delay = Duration::from_millis(250);
        let delays: Vec<_> = DelayGenerator::uniform(4, delay).collect();
        assert_eq!(delays, vec![delay; 4]);
    }

    #[test]
    fn test_none_is_immediately_exhausted() {
        let mut generator = DelayGenerator::none();
        assert!(!generator.has_next());
        assert!(generator.next_delay().is_err());
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: BackoffPolicy =
            toml::from_str("kind = \"uniform\"\nmax_retries = 2\ndelay_secs = 0.5\n").unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Uniform {
                max_retries: 2,
                delay_secs: 0.5
            }
        );

        let delays: Vec<_> = policy.generator().collect();
        assert_eq!(delays, vec![Duration::from_millis(500); 2]);
    }

    #[test]
    fn test_policy_default_is_exponential() {
        let generator = BackoffPolicy::default().generator();
        assert_eq!(generator.max_retries(), 3);
        assert_eq!(generator.remaining(), 3);
    }
}
