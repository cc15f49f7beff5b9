// Retry strategy with exponential backoff and jitter for catalog calls

use crate::config::CatalogConfig;
use rand::Rng;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// retry budget is spent
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn max_retries(&self) -> u32;

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Exponential backoff: base * 2^attempt, capped, plus up to
/// `jitter_factor` of random extra delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_catalog(&CatalogConfig::default())
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_retries,
        }
    }

    pub fn from_catalog(config: &CatalogConfig) -> Self {
        Self::with_config(
            Duration::from_secs(config.retry_base_delay_seconds),
            Duration::from_secs(config.retry_max_delay_seconds),
            0.1,
            config.max_retries,
        )
    }

    fn calculate_base_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }
        base_delay_ms + rand::thread_rng().gen_range(0..=jitter_range_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let base = self.calculate_base_delay_ms(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base)))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Fixed delay retry strategy, mostly for tests
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy =
            ExponentialBackoff::with_config(Duration::from_secs(1), Duration::from_secs(30), 0.0, 10);

        assert_eq!(strategy.calculate_base_delay_ms(0), 1_000);
        assert_eq!(strategy.calculate_base_delay_ms(1), 2_000);
        assert_eq!(strategy.calculate_base_delay_ms(2), 4_000);
        assert_eq!(strategy.calculate_base_delay_ms(4), 16_000);
        // Capped
        assert_eq!(strategy.calculate_base_delay_ms(5), 30_000);
        assert_eq!(strategy.calculate_base_delay_ms(63), 30_000);
        assert_eq!(strategy.calculate_base_delay_ms(200), 30_000);
    }

    #[test]
    fn test_retry_limit_enforcement() {
        let strategy =
            ExponentialBackoff::with_config(Duration::from_millis(1), Duration::from_millis(5), 0.1, 3);

        for attempt in 0..3 {
            assert!(strategy.next_delay(attempt).is_some());
            assert!(strategy.should_retry(attempt));
        }
        assert!(strategy.next_delay(3).is_none());
        assert!(!strategy.should_retry(3));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy =
            ExponentialBackoff::with_config(Duration::from_secs(5), Duration::from_secs(60), 0.1, 5);

        for _ in 0..20 {
            let delay = strategy.next_delay(0).unwrap().as_millis();
            assert!((5_000..=5_500).contains(&delay), "delay {}ms out of range", delay);
        }
    }

    #[test]
    fn test_from_catalog_config() {
        let config = CatalogConfig {
            max_retries: 2,
            ..CatalogConfig::default()
        };
        let strategy = ExponentialBackoff::from_catalog(&config);
        assert_eq!(strategy.max_retries(), 2);
        assert!(strategy.next_delay(2).is_none());
    }

    #[test]
    fn test_fixed_delay_strategy() {
        let delay = Duration::from_millis(10);
        let strategy = FixedDelay::new(delay, 4);
        for attempt in 0..4 {
            assert_eq!(strategy.next_delay(attempt), Some(delay));
        }
        assert_eq!(strategy.next_delay(4), None);
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let low = ExponentialBackoff::with_config(Duration::ZERO, Duration::ZERO, -0.5, 1);
        assert_eq!(low.jitter_factor, 0.0);
        let high = ExponentialBackoff::with_config(Duration::ZERO, Duration::ZERO, 1.5, 1);
        assert_eq!(high.jitter_factor, 1.0);
    }
}
