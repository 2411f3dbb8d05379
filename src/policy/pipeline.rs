//! Policy Pipeline Module
//!
//! Composes the policies in a fixed order, outermost first:
//! retry ⊃ circuit breaker ⊃ timeout ⊃ bulkhead. The bulkhead sits nearest
//! the call, the timeout bounds each attempt including its wait in the
//! bulkhead queue, the breaker observes attempt outcomes and the retry loop
//! re-issues the whole chain.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::PolicyConfig;
use crate::error::PolicyError;
use crate::policy::{Bulkhead, CircuitBreaker, CircuitState, Classify, RetryPolicy, TimeoutPolicy};

/// Why a single attempt did not produce a usable result.
#[derive(Debug)]
enum AttemptFailure {
    /// The call completed with a handled failure or a transport error
    Failed(String),
    TimedOut(Duration),
    CircuitOpen,
    BulkheadRejected,
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptFailure::Failed(_) | AttemptFailure::TimedOut(_))
    }

    fn into_error(self) -> PolicyError {
        match self {
            AttemptFailure::Failed(reason) => PolicyError::Failed(reason),
            AttemptFailure::TimedOut(after) => PolicyError::Timeout(after),
            AttemptFailure::CircuitOpen => PolicyError::CircuitOpen,
            AttemptFailure::BulkheadRejected => PolicyError::BulkheadRejected,
        }
    }
}

impl Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Failed(reason) => f.write_str(reason),
            AttemptFailure::TimedOut(after) => write!(f, "timed out after {:?}", after),
            AttemptFailure::CircuitOpen => f.write_str("circuit breaker is open"),
            AttemptFailure::BulkheadRejected => f.write_str("bulkhead rejected the call"),
        }
    }
}

// == Policy Pipeline ==
/// Failure-handling wrapper shared by every call to one downstream.
#[derive(Debug)]
pub struct PolicyPipeline {
    name: String,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker>,
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<Bulkhead>,
}

impl PolicyPipeline {
    pub fn builder(name: impl Into<String>) -> PolicyPipelineBuilder {
        PolicyPipelineBuilder {
            name: name.into(),
            retry: None,
            breaker: None,
            timeout: None,
            bulkhead: None,
        }
    }

    /// Builds the pipeline for one downstream from its settings. A zero
    /// retry count, a disabled breaker, a zero timeout or a zero parallelism
    /// each leave the corresponding policy out.
    pub fn from_config(name: impl Into<String>, config: &PolicyConfig) -> Self {
        let mut builder = Self::builder(name);
        if config.retry_count > 0 {
            builder = builder.with_retry(config.retry_count, config.initial_delay_secs);
        }
        if config.breaker_enabled {
            builder = builder.with_circuit_breaker(config.breaker_threshold, config.break_duration);
        }
        if !config.timeout.is_zero() {
            builder = builder.with_timeout(config.timeout);
        }
        if config.bulkhead_max_parallel > 0 {
            builder =
                builder.with_bulkhead(config.bulkhead_max_parallel, config.bulkhead_max_queue);
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(CircuitBreaker::state)
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    // == Execute ==
    /// Runs `operation` under every configured policy.
    ///
    /// `operation` is invoked once per attempt. A result classified as a
    /// handled failure, a transport error or a timeout is retried; an open
    /// circuit or a bulkhead rejection ends the call at once.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, PolicyError>
    where
        T: Classify,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0u32;
        loop {
            let failure = match self.attempt(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let Some(retry) = self.retry else {
                return Err(failure.into_error());
            };
            if !failure.is_retryable() {
                return Err(failure.into_error());
            }
            if retries >= retry.max_retries {
                tracing::warn!(
                    client = %self.name,
                    attempts = retries + 1,
                    reason = %failure,
                    "Retries exhausted"
                );
                return Err(PolicyError::RetryExhausted {
                    attempts: retries + 1,
                    last: failure.to_string(),
                });
            }

            retries += 1;
            let delay = retry.delay_for(retries);
            tracing::warn!(
                client = %self.name,
                attempt = retries,
                delay_secs = delay.as_secs_f64(),
                reason = %failure,
                "Retrying call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One pass through breaker, timeout and bulkhead.
    async fn attempt<T, E, F, Fut>(&self, operation: &mut F) -> Result<T, AttemptFailure>
    where
        T: Classify,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Dropped unsettled if this future is cancelled mid-attempt.
        let permit = match &self.breaker {
            Some(breaker) => Some(breaker.acquire().map_err(|_| AttemptFailure::CircuitOpen)?),
            None => None,
        };

        let outcome = self.bounded(operation()).await;

        if let Some(permit) = permit {
            match &outcome {
                Ok(_) => permit.success(),
                Err(AttemptFailure::BulkheadRejected) | Err(AttemptFailure::CircuitOpen) => {
                    drop(permit)
                }
                Err(_) => permit.failure(),
            }
        }
        outcome
    }

    /// Timeout around bulkhead around the call, then classification.
    async fn bounded<T, E, Fut>(&self, call: Fut) -> Result<T, AttemptFailure>
    where
        T: Classify,
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let guarded = async {
            match &self.bulkhead {
                Some(bulkhead) => bulkhead.run(call).await,
                None => Ok(call.await),
            }
        };

        let completed = match &self.timeout {
            Some(timeout) => match timeout.run(guarded).await {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::warn!(
                        client = %self.name,
                        timeout_ms = timeout.duration.as_millis() as u64,
                        "Attempt timed out"
                    );
                    return Err(AttemptFailure::TimedOut(timeout.duration));
                }
            },
            None => guarded.await,
        };

        match completed {
            Err(_) => Err(AttemptFailure::BulkheadRejected),
            Ok(Err(transport)) => Err(AttemptFailure::Failed(transport.to_string())),
            Ok(Ok(value)) if value.is_handled_failure() => {
                Err(AttemptFailure::Failed(value.describe()))
            }
            Ok(Ok(value)) => Ok(value),
        }
    }
}

// == Builder ==
/// Assembles a pipeline; the composition order is fixed regardless of the
/// order the policies are added in.
#[derive(Debug)]
pub struct PolicyPipelineBuilder {
    name: String,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker>,
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<Bulkhead>,
}

impl PolicyPipelineBuilder {
    pub fn with_retry(mut self, max_retries: u32, base_delay_secs: f64) -> Self {
        self.retry = Some(RetryPolicy::new(max_retries, base_delay_secs));
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, break_duration: Duration) -> Self {
        self.breaker = Some(CircuitBreaker::new(self.name.clone(), threshold, break_duration));
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(TimeoutPolicy::new(duration));
        self
    }

    pub fn with_bulkhead(mut self, max_parallel: usize, max_queue: usize) -> Self {
        self.bulkhead = Some(Bulkhead::new(self.name.clone(), max_parallel, max_queue));
        self
    }

    pub fn build(self) -> PolicyPipeline {
        PolicyPipeline {
            name: self.name,
            retry: self.retry,
            breaker: self.breaker,
            timeout: self.timeout,
            bulkhead: self.bulkhead,
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Operation that fails with `status` for the first `failures` calls.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
        status: StatusCode,
    ) -> impl FnMut() -> std::future::Ready<Result<StatusCode, String>> {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(if n < failures { status } else { StatusCode::OK }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let pipeline = PolicyPipeline::builder("test").with_retry(5, 1.5).build();
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(flaky(&calls, 3, StatusCode::INTERNAL_SERVER_ERROR))
            .await;

        assert_eq!(result, Ok(StatusCode::OK));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_exponential_backoff() {
        let pipeline = PolicyPipeline::builder("test").with_retry(2, 2.0).build();
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        pipeline
            .execute(flaky(&calls, 2, StatusCode::BAD_GATEWAY))
            .await
            .unwrap();

        // 2^1 + 2^2 seconds
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let pipeline = PolicyPipeline::builder("test").with_retry(2, 1.0).build();
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(flaky(&calls, u32::MAX, StatusCode::SERVICE_UNAVAILABLE))
            .await;

        assert!(matches!(result, Err(PolicyError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_passes_through_without_retry() {
        let pipeline = PolicyPipeline::builder("test").with_retry(5, 1.0).build();
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(flaky(&calls, u32::MAX, StatusCode::NOT_FOUND))
            .await;

        assert_eq!(result, Ok(StatusCode::NOT_FOUND));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_retried() {
        let pipeline = PolicyPipeline::builder("test").with_retry(1, 1.0).build();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = pipeline
            .execute(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(if n == 0 {
                    Err("connection refused")
                } else {
                    Ok(StatusCode::OK)
                })
            })
            .await;

        assert_eq!(result, Ok(StatusCode::OK));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_retry() {
        let pipeline = PolicyPipeline::builder("test").build();
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(flaky(&calls, 1, StatusCode::INTERNAL_SERVER_ERROR))
            .await;

        assert!(matches!(result, Err(PolicyError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_downstream() {
        let pipeline = PolicyPipeline::builder("test")
            .with_circuit_breaker(3, Duration::from_secs(40))
            .build();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let result = pipeline
                .execute(flaky(&calls, u32::MAX, StatusCode::INTERNAL_SERVER_ERROR))
                .await;
            assert!(matches!(result, Err(PolicyError::Failed(_))));
        }
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));

        let result = pipeline
            .execute(flaky(&calls, u32::MAX, StatusCode::INTERNAL_SERVER_ERROR))
            .await;

        assert_eq!(result, Err(PolicyError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "downstream must not be contacted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_short_circuits_retry() {
        let pipeline = PolicyPipeline::builder("test")
            .with_retry(5, 1.0)
            .with_circuit_breaker(2, Duration::from_secs(40))
            .build();
        let calls = Arc::new(AtomicU32::new(0));

        let result = pipeline
            .execute(flaky(&calls, u32::MAX, StatusCode::INTERNAL_SERVER_ERROR))
            .await;

        assert_eq!(result, Err(PolicyError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_recovers_after_break() {
        let pipeline = PolicyPipeline::builder("test")
            .with_circuit_breaker(1, Duration::from_secs(40))
            .build();
        let calls = Arc::new(AtomicU32::new(0));

        let _ = pipeline
            .execute(flaky(&calls, 1, StatusCode::INTERNAL_SERVER_ERROR))
            .await;
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(40)).await;

        let result = pipeline
            .execute(flaky(&calls, 1, StatusCode::INTERNAL_SERVER_ERROR))
            .await;
        assert_eq!(result, Ok(StatusCode::OK));
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_lock_circuit() {
        let pipeline = PolicyPipeline::builder("test")
            .with_circuit_breaker(1, Duration::from_secs(40))
            .build();
        let calls = Arc::new(AtomicU32::new(0));

        let _ = pipeline
            .execute(flaky(&calls, 1, StatusCode::INTERNAL_SERVER_ERROR))
            .await;
        tokio::time::advance(Duration::from_secs(41)).await;

        // The caller gives up while the half-open trial is still pending.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            pipeline.execute(|| std::future::pending::<Result<StatusCode, String>>()),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::advance(Duration::from_secs(3600)).await;

        let result = pipeline
            .execute(flaky(&calls, 0, StatusCode::OK))
            .await;
        assert_eq!(result, Ok(StatusCode::OK));
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let pipeline = PolicyPipeline::builder("test")
            .with_retry(2, 1.0)
            .with_timeout(Duration::from_millis(3000))
            .build();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = pipeline
            .execute(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, String>(StatusCode::OK)
                }
            })
            .await;

        assert_eq!(result, Ok(StatusCode::OK));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_retry() {
        let pipeline = PolicyPipeline::builder("test")
            .with_timeout(Duration::from_millis(100))
            .build();

        let result = pipeline
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(StatusCode::OK)
            })
            .await;

        assert_eq!(result, Err(PolicyError::Timeout(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn test_bulkhead_rejection_is_not_retried() {
        let pipeline = Arc::new(
            PolicyPipeline::builder("test")
                .with_retry(3, 0.0)
                .with_bulkhead(1, 0)
                .build(),
        );
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let busy = {
            let pipeline = pipeline.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                pipeline
                    .execute(move || {
                        let gate = gate.clone();
                        async move {
                            let _ = gate.acquire().await;
                            Ok::<_, String>(StatusCode::OK)
                        }
                    })
                    .await
            })
        };
        while pipeline.bulkhead().map(Bulkhead::occupancy) != Some(1) {
            tokio::task::yield_now().await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let result = pipeline.execute(flaky(&calls, 0, StatusCode::OK)).await;

        assert_eq!(result, Err(PolicyError::BulkheadRejected));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "operation is created but never awaited");

        gate.add_permits(1);
        assert_eq!(busy.await.unwrap(), Ok(StatusCode::OK));
    }

    #[test]
    fn test_from_config_disables_policies() {
        let config = PolicyConfig {
            retry_count: 0,
            breaker_enabled: false,
            timeout: Duration::ZERO,
            bulkhead_max_parallel: 0,
            ..PolicyConfig::default()
        };
        let pipeline = PolicyPipeline::from_config("users", &config);

        assert_eq!(pipeline.name(), "users");
        assert!(pipeline.circuit_state().is_none());
        assert!(pipeline.bulkhead().is_none());
    }
}
