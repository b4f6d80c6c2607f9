//! Domain errors for the rehearse engine.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur while running, persisting or repairing tests.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Test result not found: {0}")]
    ResultNotFound(Uuid),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found in graph: {0}")]
    MissingNode(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Invalid equation '{expression}': {reason}")]
    InvalidEquation { expression: String, reason: String },

    #[error("Model call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result alias used across the domain and service layers.
pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(err: serde_yaml::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Errors raised by model backends (agent, simulator, condition judge, metric judge).
///
/// Classified so the retry policy can tell transient failures from permanent ones.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a later attempt at the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout | Self::ServerError { .. }
        )
    }

    /// Short machine-readable classification, surfaced in retry notices.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::ServerError { .. } => "server_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Authentication(_) => "authentication",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Other(_) => "other",
        }
    }

    /// Provider-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::ServerError { status: 529, message: "overloaded".into() }.is_retryable());
        assert!(!LlmError::Authentication("bad key".into()).is_retryable());
        assert!(!LlmError::InvalidRequest("bad".into()).is_retryable());
        assert!(!LlmError::MalformedResponse("{".into()).is_retryable());
    }

    #[test]
    fn test_llm_error_converts_into_domain_error() {
        let err: DomainError = LlmError::Timeout.into();
        assert!(matches!(err, DomainError::Llm(LlmError::Timeout)));
        assert_eq!(err.to_string(), "Model call failed: Request timed out");
    }
}
