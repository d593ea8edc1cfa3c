//! Exponential backoff for the reconnect supervisor.

use std::time::Duration;

use rand::Rng;

use crate::config::SessionConfig;

/// Backoff policy: exponential growth from a base delay with jitter and a
/// cap. `max_attempts == 0` means unlimited.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            enabled: config.reconnect_enabled,
            base_delay: Duration::from_millis(config.reconnect_backoff_base_ms),
            max_delay: Duration::from_millis(config.reconnect_backoff_cap_ms),
            factor: 2.0,
            jitter_factor: 0.2,
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay before attempt number `attempt` (0-indexed), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(31) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(self.jitter(capped))
    }

    fn jitter(&self, seconds: f64) -> f64 {
        if self.jitter_factor <= 0.0 {
            return seconds;
        }
        let spread = seconds * self.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        (seconds + offset).max(0.0)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}
