//! Retry configuration and backoff calculation.
//!
//! Pure, sync-only building blocks: the engine crates decide *when* to
//! retry (publisher republish, reconciliation re-drive) and use this module
//! to decide *how long* to wait.

use serde::{Deserialize, Serialize};

/// Default retry budget per event.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default backoff multiplier per attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts before an event goes terminal FAILED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based), in milliseconds.
    ///
    /// `min(max_delay, base_delay * multiplier^attempt)`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = (self.base_delay_ms as f64) * factor;
        delay.min(self.max_delay_ms as f64).round() as u64
    }

    /// Delay with jitter applied from an external random value in `[0, 1)`.
    ///
    /// Maps `random` to ±20% around the deterministic delay.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn jittered_delay(&self, attempt: u32, random: f64) -> u64 {
        let base = self.delay_for_attempt(attempt) as f64;
        let jitter = 1.0 + (random * 2.0 - 1.0) * 0.2;
        (base * jitter).round().max(0.0) as u64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
