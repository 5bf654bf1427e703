//! Exponential backoff with jitter for broker reconnection.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Upper bound on the exponent so `multiplier^k` stays finite.
const MAX_EXPONENT: u32 = 1000;

/// Backoff parameters.
///
/// `delay(k) = min(max_delay, base_delay * multiplier^k)`, jittered by
/// `±jitter_fraction` and never above `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(PipelineError::validation("backoff.base_delay_ms must be > 0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PipelineError::validation(format!(
                "backoff.base_delay_ms ({}) must not exceed backoff.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PipelineError::validation("backoff.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(PipelineError::validation(
                "backoff.jitter_fraction must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay in milliseconds before jitter, uncapped.
    fn raw_delay_ms(&self, failures: u32) -> f64 {
        let exponent = failures.min(MAX_EXPONENT) as i32;
        self.base_delay_ms as f64 * self.multiplier.powi(exponent)
    }

    /// Delay after `failures` consecutive failures, without jitter.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let ms = self.raw_delay_ms(failures).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay after `failures` consecutive failures, with jitter applied.
    pub fn delay(&self, failures: u32) -> Duration {
        let raw = self.raw_delay_ms(failures);
        let jittered = if self.jitter_fraction > 0.0 {
            let spread = rand::rng().random_range(-self.jitter_fraction..=self.jitter_fraction);
            raw * (1.0 + spread)
        } else {
            raw
        };

        Duration::from_millis(jittered.clamp(0.0, self.max_delay_ms as f64) as u64)
    }
}

/// Backoff state: the policy plus the consecutive failure count.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Count a failure and return how long to wait before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.policy.delay(self.consecutive_failures)
    }

    /// Clear the failure count (on entering Connected).
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
