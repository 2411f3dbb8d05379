//! Per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use crate::error::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Runs `fut`, dropping it if it outlives the timeout.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PolicyError> {
        tokio::time::timeout(self.duration, fut)
            .await
            .map_err(|_| PolicyError::Timeout(self.duration))
    }
}
