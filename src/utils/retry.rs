use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff schedule with up to 50% random jitter per sleep.
///
/// Yields one delay per *retry*, so a policy of `max_attempts = 3` produces two
/// sleeps. Plugs into `tokio_retry::RetryIf` as its strategy.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    current: Duration,
    factor: f64,
    remaining: u32,
}

impl JitteredBackoff {
    pub fn new(base_delay: Duration, backoff_factor: f64, max_attempts: u32) -> Self {
        Self {
            current: base_delay,
            factor: backoff_factor.max(1.0),
            remaining: max_attempts.saturating_sub(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.backoff_factor,
            config.max_attempts,
        )
    }
}

impl Iterator for JitteredBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.current;
        self.current = delay.mul_f64(self.factor);
        Some(delay + jitter(delay))
    }
}

/// Uniform extra wait in `[0, delay / 2]`.
pub fn jitter(delay: Duration) -> Duration {
    let max = delay.as_secs_f64() * 0.5;
    if max <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=max))
}

/// Uniform delay in `[min, max]`, used to spread out requests.
pub fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_yields_one_delay_per_retry() {
        let delays: Vec<_> = JitteredBackoff::new(Duration::from_millis(100), 2.0, 3).collect();
        assert_eq!(delays.len(), 2);
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        assert_eq!(JitteredBackoff::new(Duration::from_millis(100), 2.0, 1).count(), 0);
        assert_eq!(JitteredBackoff::new(Duration::from_millis(100), 2.0, 0).count(), 0);
    }

    #[test]
    fn test_backoff_grows_within_jitter_bounds() {
        let delays: Vec<_> = JitteredBackoff::new(Duration::from_millis(100), 2.0, 4).collect();

        let expected = [100u128, 200, 400];
        for (delay, base) in delays.iter().zip(expected) {
            let millis = delay.as_millis();
            assert!(millis >= base, "{}ms below base {}ms", millis, base);
            assert!(millis <= base + base / 2, "{}ms above jitter cap for {}ms", millis, base);
        }
    }

    #[test]
    fn test_backoff_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10,
            backoff_factor: 3.0,
        };
        let delays: Vec<_> = JitteredBackoff::from_config(&config).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays[3] >= Duration::from_millis(270));
    }

    #[test]
    fn test_random_delay_bounds() {
        let min = Duration::from_millis(200);
        let max = Duration::from_millis(500);
        for _ in 0..50 {
            let delay = random_delay(min, max);
            assert!(delay >= min && delay <= max);
        }
        assert_eq!(random_delay(max, min), max);
    }

    #[test]
    fn test_zero_delay_has_no_jitter() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
