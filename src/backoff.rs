//! Exponential backoff shared by the rate limiter and the retry loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential backoff with random jitter.
///
/// `delay = min(base_delay_ms * multiplier^(attempt - 1), max_delay_ms)`,
/// then up to `jitter * delay` extra so retries from different units do not
/// fire in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay for a 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` with random jitter applied, never above the cap.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let base_ms = base.as_millis() as u64;
        let spread = (base_ms as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            return base;
        }
        let extra = rand::random_range(0..=spread);
        Duration::from_millis((base_ms + extra).min(self.max_delay_ms.max(base_ms)))
    }
}
