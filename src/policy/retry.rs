//! Retry policy with exponential backoff.

use std::time::Duration;

/// Retry settings: the delay before retry `n` (1-based) is
/// `base_delay_secs ^ n` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_secs: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: f64) -> Self {
        Self {
            max_retries,
            base_delay_secs,
        }
    }

    /// Delay before the given retry. Out-of-range results saturate.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let secs = self.base_delay_secs.powi(retry as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
