//! CP-018: Exponential backoff for generator transport retries.

use crate::config::ConversionConfig;
use std::time::Duration;

/// Doubling delay between `initial` and `max`. A server-provided
/// `retry-after` overrides the computed delay but is still capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Retries allowed after the first call.
    pub max_retries: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_retries,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_transport_retries,
        )
    }

    /// No waiting; for tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_retries)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max);
        }
        let shift = retry.saturating_sub(1).min(31);
        let factor = 1u32 << shift;
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}
