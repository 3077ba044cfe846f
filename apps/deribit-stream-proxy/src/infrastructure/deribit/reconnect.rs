//! Reconnection Policy
//!
//! Exponential backoff with jitter for re-establishing a closed session.
//! The delay before attempt `n` (0-based) is
//! `min(initial * multiplier^n, max)`, then scaled by a random factor in
//! `[1 - jitter, 1 + jitter]`.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum number of attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.delay_initial,
            max_delay: settings.delay_max,
            multiplier: settings.delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Backoff state across consecutive failed attempts.
///
/// ```rust
/// use deribit_stream_proxy::infrastructure::deribit::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     multiplier: 2.0,
///     jitter_factor: 0.0,
///     max_attempts: 0,
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
/// policy.reset();
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.backoff(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(self.jitter(delay))
    }

    /// Start over after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    fn jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor.clamp(0.0, 1.0);
        if factor <= 0.0 {
            return delay;
        }

        let scale = rand::rng().random_range((1.0 - factor)..=(1.0 + factor));
        delay.mul_f64(scale).max(Duration::from_millis(1))
    }
}

/// Why the supervisor stopped reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
    /// The venue rejected the credentials; retrying cannot help.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
}
