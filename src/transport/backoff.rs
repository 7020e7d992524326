use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Stateful backoff used by reconnect loops
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = exponential_delay(
            Duration::from_millis(self.config.initial_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
            self.config.multiplier,
            self.attempt,
        );
        self.attempt = self.attempt.saturating_add(1);
        apply_jitter(base, self.config.jitter)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// `initial * multiplier^attempt`, capped at `max`
pub fn exponential_delay(initial: Duration, max: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt.min(64) as i32);
    let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.5,
            ..no_jitter()
        });
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((50..=150).contains(&delay), "delay {delay} outside jitter band");
        }
    }

    #[test]
    fn test_exponential_delay_huge_attempt_is_capped() {
        let delay = exponential_delay(
            Duration::from_millis(100),
            Duration::from_secs(60),
            2.0,
            u32::MAX,
        );
        assert_eq!(delay, Duration::from_secs(60));
    }
}
