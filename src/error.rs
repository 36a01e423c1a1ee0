//! Request-level error taxonomy for the RAG pipeline.
//!
//! Provider and backend failures are classified into [`RagError`] at the
//! orchestrator boundary. Degraded retrieval is not an error; it travels as
//! a flag on the response.

use knowbridge_core::error::{ProviderError, RetrievalUnavailable};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// No search channel could serve the query. Try again later.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Fatal embedding problem during indexing (e.g. dimension mismatch).
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The completion provider failed after retries.
    #[error("completion failed: {0}")]
    Completion(#[from] ProviderError),

    /// A prompt template is malformed. Raised during startup validation.
    #[error("template configuration error: {0}")]
    TemplateConfiguration(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<RetrievalUnavailable> for RagError {
    fn from(e: RetrievalUnavailable) -> Self {
        RagError::RetrievalUnavailable(e.0)
    }
}

impl RagError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::RetrievalUnavailable(_) => "retrieval_unavailable",
            RagError::EmbeddingFailed(_) => "embedding_failed",
            RagError::Completion(ProviderError::ContentFiltered(_)) => "content_filtered",
            RagError::Completion(ProviderError::InvalidRequest(_))
            | RagError::Completion(ProviderError::InvalidInput(_)) => "invalid_request",
            RagError::Completion(ProviderError::Timeout(_)) => "timeout",
            RagError::Completion(_) => "completion_unavailable",
            RagError::TemplateConfiguration(_) => "template_configuration",
            RagError::ConversationNotFound(_) => "conversation_not_found",
            RagError::DocumentNotFound(_) => "document_not_found",
            RagError::Storage(_) => "storage_error",
        }
    }

    /// Whether the caller did something wrong (4xx) rather than the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RagError::ConversationNotFound(_)
                | RagError::DocumentNotFound(_)
                | RagError::Completion(ProviderError::ContentFiltered(_))
                | RagError::Completion(ProviderError::InvalidInput(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            RagError::from(RetrievalUnavailable("both down".into())).code(),
            "retrieval_unavailable"
        );
        let filtered = RagError::from(ProviderError::ContentFiltered("x".into()));
        assert_eq!(filtered.code(), "content_filtered");
        assert!(filtered.is_caller_error());
        assert!(!RagError::Completion(ProviderError::Timeout(3)).is_caller_error());
        assert!(RagError::ConversationNotFound("c".into()).is_caller_error());
    }
}
