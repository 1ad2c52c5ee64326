//! Retry policy for transient transfer failures.
//!
//! Implements exponential backoff with configurable parameters. Retries
//! happen inside a live work unit between attempts, so the defaults are on
//! the millisecond scale.

use std::time::Duration;

use crate::config::TransferSettings;

use super::error::TransferError;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before the unit fails permanently.
    pub max_retries: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds (cap for exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_ms: settings.initial_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Backoff before retry number `attempt` (zero-based):
    /// `initial * multiplier^attempt`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Whether an error at the given attempt count warrants another try.
    pub fn should_retry(&self, error: &TransferError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}
