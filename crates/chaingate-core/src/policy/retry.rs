//! Exponential backoff policy with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add up to `jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy. Computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before the `attempt`-th retry (1-based), ignoring `max_retries`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.config.initial_backoff.as_millis() as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);

        let jitter_ms = if self.config.jitter_fraction > 0.0 && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * self.config.jitter_fraction)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter_ms) as u64)
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt).then(|| self.backoff(attempt))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn exponential_delays() {
        let policy = no_jitter(3);
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 10.0,
            jitter_fraction: 0.0,
        });
        assert_eq!(policy.backoff(5), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_fraction: 0.5,
            ..RetryConfig::default()
        });
        for _ in 0..20 {
            let d = policy.backoff(1).as_millis();
            assert!((100..=150).contains(&d), "delay {d}ms outside jitter band");
        }
    }

    #[test]
    fn should_retry_boundary() {
        let policy = no_jitter(2);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
