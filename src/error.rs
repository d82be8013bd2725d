// =============================================================================
// Service error taxonomy
// =============================================================================
//
// Every fallible boundary in the service maps its failures onto this enum.
// Provider failures are locally recoverable (the fetch fabric retries and
// fails over); `NotReady` means a gate declined the work and the caller
// should skip, not fail; `Internal` is logged with context but exposed to
// HTTP callers only as a generic message.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("provider {provider} returned no data")]
    ProviderEmpty { provider: String },

    #[error("provider {provider} http error: {message}")]
    ProviderHttp { provider: String, message: String },

    #[error("provider {provider} parse error: {message}")]
    ProviderParse { provider: String, message: String },

    #[error("rate limit exhausted after {attempts} attempts: {last_error}")]
    RateLimitExhausted { attempts: u32, last_error: String },

    #[error("redis unavailable: {0}")]
    RedisUnavailable(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("job {0} is already running")]
    ConflictSingleton(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable kind string, used in execution logs and the
    /// scheduler status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::ProviderEmpty { .. } => "provider_empty",
            Self::ProviderHttp { .. } => "provider_http",
            Self::ProviderParse { .. } => "provider_parse",
            Self::RateLimitExhausted { .. } => "rate_limit_exhausted",
            Self::RedisUnavailable(_) => "redis_unavailable",
            Self::NotReady(_) => "not_ready",
            Self::NotFound(_) => "not_found",
            Self::BadInput(_) => "bad_input",
            Self::ConflictSingleton(_) => "conflict_singleton",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the fetch fabric should keep trying other providers after
    /// seeing this error.
    pub fn is_provider_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProviderEmpty { .. }
                | Self::ProviderHttp { .. }
                | Self::ProviderParse { .. }
                | Self::RateLimitExhausted { .. }
        )
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(e: redis::RedisError) -> Self {
        Self::RedisUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json codec: {e}"))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ServiceError::Cancelled.kind(), "cancelled");
        assert_eq!(
            ServiceError::NotReady("registry incomplete".into()).kind(),
            "not_ready"
        );
        assert_eq!(
            ServiceError::ConflictSingleton("compute_signals".into()).kind(),
            "conflict_singleton"
        );
    }

    #[test]
    fn provider_errors_are_recoverable() {
        assert!(ServiceError::ProviderEmpty {
            provider: "sina".into()
        }
        .is_provider_recoverable());
        assert!(ServiceError::RateLimitExhausted {
            attempts: 3,
            last_error: "timeout".into()
        }
        .is_provider_recoverable());
        assert!(!ServiceError::RedisUnavailable("down".into()).is_provider_recoverable());
        assert!(!ServiceError::BadInput("x".into()).is_provider_recoverable());
    }
}
