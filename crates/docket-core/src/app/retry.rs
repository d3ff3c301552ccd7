//! Retry policy: which provider failures are retried, how often, and how long to wait.
//!
//! Worker はこのオブジェクトにだけ判断を委ねる（呼び出し箇所ごとに retry を書かない）。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::millis;
use crate::error::{ErrorClass, ProviderError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per task, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,

    /// Error classes that are worth another attempt.
    pub retry_on: Vec<ErrorClass>,
}

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Retryable, but the attempt limit is used up.
    Exhausted,
    /// Not retryable at all.
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retry_on: vec![ErrorClass::Transient, ErrorClass::Timeout],
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failure (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        self.retry_on.contains(&class)
    }

    pub fn decide(&self, attempts: u32, error: &ProviderError) -> RetryDecision {
        if !self.is_retryable(error.class()) {
            RetryDecision::GiveUp
        } else if attempts >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.next_delay(attempts))
        }
    }
}
