use crate::validation::ValidationResult;
use std::time::Duration;
use thiserror::Error;

/// Typed error hierarchy for modelgate.
///
/// Use at module boundaries (provider calls, routing, validation, stores).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("circuit breaker is open for model '{model}' ({retry_in_secs}s remaining)")]
    CircuitOpen { model: String, retry_in_secs: u64 },

    /// Staged retry exhausted the human-escalation threshold. Carries the last
    /// response and the accumulated validation errors so an upstream UI can
    /// display what the model produced and what the validators complained about.
    #[error("human review required after {attempts} failed attempts")]
    HumanReviewNeeded {
        attempts: usize,
        last_response: Option<Box<crate::request::ChatResponse>>,
        validation_errors: Vec<ValidationResult>,
    },

    #[error("validation failed after {attempts} attempts; last errors: {summary}")]
    RetryExhausted { attempts: usize, summary: String },

    #[error("validator recursion depth {depth} exceeds maximum {max}")]
    RecursionLimit { depth: usize, max: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether this error is transient and the attempt should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Transport(_) | Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Internal(_) => true,
            Self::Config(_)
            | Self::Auth(_)
            | Self::CircuitOpen { .. }
            | Self::HumanReviewNeeded { .. }
            | Self::RetryExhausted { .. }
            | Self::RecursionLimit { .. }
            | Self::Cancelled => false,
        }
    }

    /// Whether this error counts toward the circuit breaker's failure window.
    /// Validation failures and configuration mistakes never trip the breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::Transport(_)
                | Self::Timeout(_)
                | Self::Provider { retryable: true, .. }
        )
    }

    /// Whether retrying can never help (surface immediately).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}
