//! Exponential retry delays.

use std::time::Duration;

use rand::Rng;

use crate::config::DeliveryConfig;

/// Share of the delay randomised either way, so rows failed together
/// do not retry together.
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.backoff_base_secs),
            max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max`. `attempt` is the one that
    /// just failed, starting at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// [`Backoff::delay`] with ±10% jitter, still capped.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt).as_secs_f64();
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        Duration::from_secs_f64(delay * factor).min(self.max)
    }
}
