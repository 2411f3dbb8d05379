//! Error types for the lookup gateway
//!
//! Provides unified error handling using thiserror. Each concern (cache,
//! outbound policies, broker) has its own enum; `GatewayError` is what the
//! request path and the HTTP surface deal in.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Gateway Error Enum ==
/// Unified error type for the request path.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A downstream service could not answer (retries exhausted, circuit open,
    /// timeout, bulkhead rejection or an unusable response)
    #[error("{service} service is unavailable: {reason}")]
    DownstreamUnavailable {
        service: &'static str,
        reason: String,
    },

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl GatewayError {
    /// Builds a `DownstreamUnavailable` error for the given service.
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::DownstreamUnavailable {
            service,
            reason: reason.into(),
        }
    }

    /// Returns true if this error means a downstream could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::DownstreamUnavailable { .. })
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::DownstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) | GatewayError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Cache Error Enum ==
/// Errors raised by cache backends.
///
/// Corrupt payloads are not represented here: the store heals them and
/// reports a miss instead.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The backend could not be reached or rejected the command
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Key longer than the backend accepts
    #[error("Key exceeds maximum length of {0} bytes")]
    KeyTooLong(usize),

    /// Value could not be serialized before writing
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// == Policy Error Enum ==
/// Failure signals produced by the outbound policy pipeline.
///
/// Every variant means the downstream is unavailable; callers decide whether
/// that is a hard error or a fallback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// Every permitted attempt failed
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    /// The single permitted attempt failed (retry disabled)
    #[error("call failed: {0}")]
    Failed(String),

    /// The circuit breaker is open and the call was not attempted
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The attempt exceeded its timeout (retry disabled)
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The bulkhead was full and the call was rejected
    #[error("bulkhead rejected the call")]
    BulkheadRejected,
}

// == Broker Error Enum ==
/// Errors raised by broker transports and the connection manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("broker channel is closed")]
    ChannelClosed,

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// Startup gave up after the bounded retry
    #[error("broker connection attempts exhausted after {attempts} tries: {last}")]
    StartupExhausted { attempts: u32, last: String },

    #[error("broker connection manager is shut down")]
    ShutDown,

    #[error("broker connection cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Returns true if the error means the connection itself is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_) | BrokerError::ConnectionClosed
        )
    }
}

// == Decode Error Enum ==
/// A broker payload that cannot become a message. Such messages are rejected
/// without requeue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload is null")]
    Null,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

// == Result Type Alias ==
/// Convenience Result type for the request path.
pub type Result<T> = std::result::Result<T, GatewayError>;
