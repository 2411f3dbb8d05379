//! Policy Module
//!
//! Failure-handling policies for outbound calls and the fixed-order pipeline
//! that composes them: retry ⊃ circuit breaker ⊃ timeout ⊃ bulkhead.

mod bulkhead;
mod circuit_breaker;
mod pipeline;
mod retry;
mod timeout;

pub use bulkhead::Bulkhead;
pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState};
pub use pipeline::{PolicyPipeline, PolicyPipelineBuilder};
pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

use reqwest::StatusCode;

/// Decides whether a completed call counts as a failure.
///
/// A handled failure is retried and counted by the circuit breaker. Anything
/// else passes through the pipeline untouched.
pub trait Classify {
    fn is_handled_failure(&self) -> bool;

    /// Short description for log fields and error messages.
    fn describe(&self) -> String;
}

/// Anything that is not a success is a failure, except "not found", which is
/// a valid negative answer.
impl Classify for StatusCode {
    fn is_handled_failure(&self) -> bool {
        !self.is_success() && *self != StatusCode::NOT_FOUND
    }

    fn describe(&self) -> String {
        format!("status {}", self)
    }
}

impl Classify for reqwest::Response {
    fn is_handled_failure(&self) -> bool {
        self.status().is_handled_failure()
    }

    fn describe(&self) -> String {
        self.status().describe()
    }
}
