//! Gateway error types.
//!
//! Classification into transient and permanent failures drives the retry
//! loop and the circuit breaker: only transient errors are retried, and only
//! transient errors count toward opening a circuit.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur talking to the LLM backend.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request did not complete within the effective request timeout.
    #[error("backend request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// HTTP 429.
    #[error("backend rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("backend server error HTTP {status}: {body}")]
    ServerError { status: u16, body: String },

    /// TCP/HTTP connection to the backend failed.
    #[error("connection failed to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// HTTP 4xx other than 429.
    #[error("backend rejected request HTTP {status}: {body}")]
    ClientError { status: u16, body: String },

    /// The response body could not be understood.
    #[error("failed to decode backend response: {reason}")]
    Decode { reason: String },

    /// The endpoint's circuit is open; no request was sent.
    #[error("circuit open for {endpoint}, retry in {retry_in_ms}ms")]
    CircuitOpen { endpoint: String, retry_in_ms: u64 },

    /// Client construction or request building failed.
    #[error("gateway config error: {reason}")]
    Config { reason: String },
}

impl GatewayError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::ServerError { .. }
                | GatewayError::Connection { .. }
        )
    }

    /// Server-requested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map a non-success HTTP status and its body to an error.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => GatewayError::RateLimited { retry_after },
            500..=599 => GatewayError::ServerError { status, body },
            _ => GatewayError::ClientError { status, body },
        }
    }
}
