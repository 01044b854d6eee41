//! Retry Policy with Exponential Backoff
//!
//! Remote object-store requests fail transiently all the time (connection resets,
//! 500s, 503 SlowDown). The remote client retries those failures with exponential
//! backoff and jitter, up to a bounded number of attempts.
//!
//! ```text
//! Attempt 1: immediate
//! Attempt 2: wait ~100ms
//! Attempt 3: wait ~200ms
//! Attempt 4: wait ~400ms
//! ...        capped at max_backoff
//! ```
//!
//! ## Jitter
//!
//! With jitter enabled the computed backoff is scaled by a random factor in
//! `[0.5, 1.0]` so that many clients failing at the same moment do not retry in
//! lockstep against a recovering endpoint.
//!
//! Only the remote client decides *what* is retryable; this module only decides
//! *how long* to wait.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
///
/// `max_attempts` counts every attempt including the first one, so a policy with
/// `max_attempts: 1` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, first try included (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry (default: 100ms)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Upper bound for a single backoff (default: 10s)
    #[serde(default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Growth factor between consecutive backoffs (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize backoffs to avoid synchronized retries (default: true)
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic backoff for the given retry number (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms).max(0.0) as u64)
    }

    /// Backoff for the given retry number with jitter applied when enabled.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 0.5 + rand::random::<f64>() * 0.5; // 0.5-1.0x
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
