//! Retry policies
//!
//! Used by the compare-and-set ideal state updater:
//! - Random delay between a min and max (default for ideal state writes)
//! - Exponential backoff
//! - Fixed delay

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    Fixed {
        max_attempts: u32,
        delay_ms: u64,
    },
    ExponentialBackoff {
        max_attempts: u32,
        initial_delay_ms: u64,
        multiplier: f64,
    },
    RandomDelay {
        max_attempts: u32,
        min_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ideal_state_update()
    }
}

impl RetryPolicy {
    /// 20 attempts with a random 100-200ms pause
    pub fn ideal_state_update() -> Self {
        RetryPolicy::RandomDelay {
            max_attempts: 20,
            min_delay_ms: 100,
            max_delay_ms: 200,
        }
    }

    /// 5 attempts starting at 1s, doubling
    pub fn exponential() -> Self {
        RetryPolicy::ExponentialBackoff {
            max_attempts: 5,
            initial_delay_ms: 1000,
            multiplier: 2.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::ExponentialBackoff { max_attempts, .. }
            | RetryPolicy::RandomDelay { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Pause before the retry following the given (0-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Fixed { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryPolicy::ExponentialBackoff {
                initial_delay_ms,
                multiplier,
                ..
            } => {
                let factor = multiplier.max(1.0).powi(attempt.min(32) as i32);
                Duration::from_millis((*initial_delay_ms as f64 * factor) as u64)
            }
            RetryPolicy::RandomDelay {
                min_delay_ms,
                max_delay_ms,
                ..
            } => {
                let (lo, hi) = if min_delay_ms <= max_delay_ms {
                    (*min_delay_ms, *max_delay_ms)
                } else {
                    (*max_delay_ms, *min_delay_ms)
                };
                Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_random_delay_in_range() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 20);
        for attempt in 0..50 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::Fixed {
            max_attempts: 0,
            delay_ms: 0,
        };
        assert_eq!(policy.max_attempts(), 1);
    }
}
