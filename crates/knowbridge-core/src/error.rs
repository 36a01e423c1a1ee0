//! Error taxonomy shared by providers and backends.

use thiserror::Error;

/// Failure of an external embedding or completion provider.
///
/// Only [`RateLimited`](ProviderError::RateLimited),
/// [`Unavailable`](ProviderError::Unavailable), and
/// [`Timeout`](ProviderError::Timeout) are transient; everything else
/// fails fast.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("content filtered: {0}")]
    ContentFiltered(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("provider is disabled")]
    Disabled,
}

impl ProviderError {
    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Unavailable(_) | ProviderError::Timeout(_)
        )
    }

    /// Classify an HTTP status code returned by a provider.
    ///
    /// `429` → rate limited, `408` and `5xx` → unavailable,
    /// `400`/`413`/`422` → invalid input, remaining `4xx` → invalid request.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status, body);
        match status {
            429 => ProviderError::RateLimited(detail),
            408 | 500..=599 => ProviderError::Unavailable(detail),
            400 | 413 | 422 => {
                if body.contains("content_filter") || body.contains("content_policy") {
                    ProviderError::ContentFiltered(detail)
                } else {
                    ProviderError::InvalidInput(detail)
                }
            }
            _ => ProviderError::InvalidRequest(detail),
        }
    }
}

/// Returned by a search backend when an upsert batch exceeds its
/// per-request limit. The indexer splits the batch and retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("batch of {size} chunks exceeds backend limit of {limit}")]
pub struct BatchTooLarge {
    pub size: usize,
    pub limit: usize,
}

/// Every search channel needed to answer a query failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("retrieval unavailable: {0}")]
pub struct RetrievalUnavailable(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimited("HTTP 429: slow down".to_string())
        );
        assert!(ProviderError::from_status(503, "").is_retryable());
        assert!(matches!(
            ProviderError::from_status(400, "bad"),
            ProviderError::InvalidInput(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, r#"{"code":"content_filter"}"#),
            ProviderError::ContentFiltered(_)
        ));
        assert!(matches!(
            ProviderError::from_status(401, "no key"),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_request_timeout_is_transient() {
        let err = ProviderError::from_status(408, "request timeout");
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable() {
        assert!(ProviderError::Timeout(5).is_retryable());
        assert!(!ProviderError::ContentFiltered(String::new()).is_retryable());
        assert!(!ProviderError::InvalidInput(String::new()).is_retryable());
        assert!(!ProviderError::Disabled.is_retryable());
    }
}
