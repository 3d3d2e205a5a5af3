//! Retry policy for transient download failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts before an entry is marked failed.
    pub max_retries: u32,
    /// Lower bound of the delay before a failed entry is queued again.
    pub min_delay_ms: u64,
    /// Upper bound of the delay before a failed entry is queued again.
    pub max_delay_ms: u64,
    /// Pick the delay uniformly between the bounds instead of using the minimum.
    pub randomize: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 1000,
            max_delay_ms: 5000,
            randomize: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt.
    pub fn next_delay(&self) -> Duration {
        let min = self.min_delay_ms.min(self.max_delay_ms);
        let max = self.min_delay_ms.max(self.max_delay_ms);

        let delay_ms = if self.randomize && max > min {
            let span = (max - min) as f64;
            min + (span * rand::random::<f64>()).round() as u64
        } else {
            min
        };

        Duration::from_millis(delay_ms)
    }

    /// Check if another attempt should be made after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let config = RetryConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(!config.should_retry(0));
    }

    #[test]
    fn test_fixed_delay_uses_minimum() {
        let config = RetryConfig {
            max_retries: 3,
            min_delay_ms: 250,
            max_delay_ms: 10_000,
            randomize: false,
        };
        assert_eq!(config.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_random_delay_stays_within_bounds() {
        let config = RetryConfig {
            max_retries: 3,
            min_delay_ms: 100,
            max_delay_ms: 200,
            randomize: true,
        };
        for _ in 0..200 {
            let delay = config.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_swapped_bounds_are_tolerated() {
        let config = RetryConfig {
            max_retries: 1,
            min_delay_ms: 300,
            max_delay_ms: 100,
            randomize: false,
        };
        assert_eq!(config.next_delay(), Duration::from_millis(100));
    }
}
