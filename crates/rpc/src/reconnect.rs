//! Exponential-backoff schedule for the outbound RPC channel.
//!
//! The delay before attempt `n` (1-based, counting consecutive failures)
//! is `initial_delay * multiplier^(n-1)`, clamped to `max_delay`, plus a
//! random jitter of up to `max_jitter`. The attempt counter resets after
//! any successful connect, so the next failure starts again from
//! `initial_delay`.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts (before jitter).
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on the random extra delay added to each attempt.
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Deterministic part of the delay before attempt number `attempt`.
///
/// Attempt `0` is treated like attempt `1`.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let factor = config.multiplier.max(1.0).powi(exponent);
    let millis = config.initial_delay.as_millis() as f64 * factor;
    let max_ms = config.max_delay.as_millis() as f64;
    Duration::from_millis(millis.min(max_ms) as u64)
}

/// Add a random jitter in `[0, max_jitter]` to `delay`.
pub fn with_jitter(delay: Duration, config: &ReconnectConfig) -> Duration {
    let max_ms = config.max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Full delay (backoff plus jitter) before attempt number `attempt`.
pub fn next_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    with_jitter(backoff_delay(attempt, config), config)
}
