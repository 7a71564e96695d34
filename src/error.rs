//! Crate-wide error type.

use thiserror::Error;

/// Result type alias using this crate's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the audit pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A required configuration value was missing or out of range.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provider rejected credentials (HTTP 401). Non-retryable.
    #[error("authentication failed for provider '{provider}'")]
    Authentication { provider: String },

    /// Provider signalled rate limiting (HTTP 429) or the local limiter
    /// refused admission. Retryable.
    #[error("rate limited by provider '{provider}', retry after {retry_after_ms}ms")]
    RateLimit {
        provider: String,
        retry_after_ms: u64,
    },

    /// Provider returned a 5xx or the connection failed. Retryable with a
    /// status-classified backoff (see `is_retryable`/`retry_multiplier`).
    #[error("provider '{provider}' server error (status {status})")]
    ServerError { provider: String, status: u16 },

    /// Request failed local validation before being sent. Non-retryable.
    #[error("model validation failed: {0}")]
    ModelValidation(String),

    /// The HTTP call itself timed out.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The recursion monitor refused re-entry (cycle or depth exceeded).
    /// Never retried.
    #[error("recursion limit hit: {}", stack.join(" -> "))]
    Recursion { stack: Vec<String> },

    /// The circuit breaker for a provider is open.
    #[error("circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    /// The aggregator could not extract any structured finding from a
    /// response; callers degrade gracefully rather than propagate this.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// No provider was available to service a request.
    #[error("no LLM provider available: {0}")]
    NoProviderAvailable(String),

    /// A session-level operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying I/O failure (cache disk access, file reads during discovery).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport failure not otherwise classified.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn authentication(provider: impl Into<String>) -> Self {
        Self::Authentication {
            provider: provider.into(),
        }
    }

    pub fn rate_limit(provider: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::RateLimit {
            provider: provider.into(),
            retry_after_ms,
        }
    }

    pub fn server_error(provider: impl Into<String>, status: u16) -> Self {
        Self::ServerError {
            provider: provider.into(),
            status,
        }
    }

    pub fn model_validation(message: impl Into<String>) -> Self {
        Self::ModelValidation(message.into())
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn recursion(stack: Vec<String>) -> Self {
        Self::Recursion { stack }
    }

    pub fn circuit_open(provider: impl Into<String>) -> Self {
        Self::CircuitOpen {
            provider: provider.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn no_provider_available(message: impl Into<String>) -> Self {
        Self::NoProviderAvailable(message.into())
    }

    /// Whether this error's originating operation is safe to retry.
    ///
    /// Recursion errors, validation errors, and cancellation are never
    /// retried; `CircuitOpen` is only retried once the breaker recovers
    /// (the caller is expected to re-check, not retry immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimit { .. } | Error::ServerError { .. } | Error::Timeout { .. }
        )
    }

    /// Backoff multiplier base used per §4.D: 502 -> 4^n, 503 -> 5^n,
    /// timeout -> 1.5*2^n, everything else retryable -> 2^n.
    pub fn backoff_base(&self) -> f64 {
        match self {
            Error::ServerError { status: 502, .. } => 4.0,
            Error::ServerError { status: 503, .. } => 5.0,
            Error::Timeout { .. } => 2.0,
            _ => 2.0,
        }
    }

    /// Leading multiplier applied in front of the exponential term (only
    /// the timeout classifier has one per §4.D: `1s × 1.5 × 2^n`).
    pub fn backoff_leading_factor(&self) -> f64 {
        match self {
            Error::Timeout { .. } => 1.5,
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::rate_limit("qwen", 1000).is_retryable());
        assert!(Error::server_error("qwen", 502).is_retryable());
        assert!(Error::timeout(5000).is_retryable());
        assert!(!Error::authentication("qwen").is_retryable());
        assert!(!Error::recursion(vec!["a".into()]).is_retryable());
        assert!(!Error::circuit_open("qwen").is_retryable());
    }

    #[test]
    fn backoff_base_per_status() {
        assert_eq!(Error::server_error("x", 502).backoff_base(), 4.0);
        assert_eq!(Error::server_error("x", 503).backoff_base(), 5.0);
        assert_eq!(Error::timeout(1).backoff_base(), 2.0);
        assert_eq!(Error::timeout(1).backoff_leading_factor(), 1.5);
        assert_eq!(Error::server_error("x", 500).backoff_base(), 2.0);
    }
}
