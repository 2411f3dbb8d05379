//! Consecutive-failure circuit breaker.
//!
//! Closed → Open after `threshold` consecutive handled failures. Open →
//! HalfOpen once the break duration has elapsed. In HalfOpen a single trial
//! call is let through: success closes the circuit, failure re-opens it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::PolicyError;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    break_duration: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, break_duration: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            break_duration,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Current state, moving Open to HalfOpen if the break has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state);
        match *state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    // == Acquire ==
    /// Asks permission for one call. Fails fast while the circuit is open or
    /// while the half-open trial is in flight.
    ///
    /// The returned permit must be settled with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]; dropping it unsettled hands the half-open
    /// trial slot back.
    pub fn acquire(&self) -> Result<CircuitPermit<'_>, PolicyError> {
        let mut state = self.lock();
        self.refresh(&mut state);
        let trial = match *state {
            State::Closed { .. } => false,
            State::Open { .. } | State::HalfOpen { trial_in_flight: true } => {
                return Err(PolicyError::CircuitOpen)
            }
            State::HalfOpen { trial_in_flight: false } => {
                *state = State::HalfOpen { trial_in_flight: true };
                true
            }
        };
        Ok(CircuitPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    // == Outcomes ==
    /// A success while Open comes from a call admitted before the circuit
    /// broke and leaves the break in place.
    fn record_success(&self) {
        let mut state = self.lock();
        match *state {
            State::Closed { .. } => *state = State::Closed { failures: 0 },
            State::HalfOpen { .. } => {
                tracing::info!(client = %self.name, "Circuit breaker reset, requests are allowed again");
                *state = State::Closed { failures: 0 };
            }
            State::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        match *state {
            State::Closed { failures } if failures + 1 < self.threshold => {
                *state = State::Closed { failures: failures + 1 };
            }
            State::Closed { .. } | State::HalfOpen { .. } => {
                tracing::warn!(
                    client = %self.name,
                    break_secs = self.break_duration.as_secs_f64(),
                    threshold = self.threshold,
                    "Circuit breaker opened"
                );
                *state = State::Open {
                    until: Instant::now() + self.break_duration,
                };
            }
            State::Open { .. } => {}
        }
    }

    fn release_trial(&self) {
        let mut state = self.lock();
        if let State::HalfOpen { trial_in_flight: true } = *state {
            *state = State::HalfOpen { trial_in_flight: false };
        }
    }

    fn refresh(&self, state: &mut State) {
        if let State::Open { until } = *state {
            if Instant::now() >= until {
                tracing::info!(client = %self.name, "Circuit breaker is half-open, testing next request");
                *state = State::HalfOpen { trial_in_flight: false };
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "an unsettled permit counts as an abandoned call"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::debug!(client = %self.breaker.name, "Half-open trial abandoned");
            self.breaker.release_trial();
        }
    }
}
