//! Query-time context retrieval.
//!
//! `retrieve_context` embeds the query, runs [`hybrid_search`], drops
//! results under the relevance threshold, loads chunk text, and selects a
//! token-budgeted set of [`ContextFragment`]s.
//!
//! Relevance: when vector search participated, a result must have a raw
//! cosine similarity of at least `min_relevance`. When only keyword search
//! ran (provider disabled or vector channel down), keyword hits count as
//! relevant. An empty result is a normal outcome.
//!
//! Each search channel has its own deadline (`search_timeout`); a channel
//! that overruns it counts as failed, so a slow vector index degrades the
//! response instead of failing it.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use knowbridge_core::context::{select_fragments, BudgetParams, ContextFragment, RankedChunk};
use knowbridge_core::embedding::EmbeddingProvider;
use knowbridge_core::models::{Chunk, IndexedChunk};
use knowbridge_core::search::{hybrid_search, HybridParams, SearchRequest, SearchResponse};
use knowbridge_core::store::{ChunkCandidate, SearchBackend, SearchFilters};

use crate::config::Config;
use crate::error::RagError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub hybrid: HybridParams,
    pub top_k: usize,
    pub min_relevance: f64,
    pub budget: BudgetParams,
    pub search_timeout: Duration,
    pub embed_timeout: Duration,
    pub embed_retry: RetryPolicy,
}

impl RetrievalSettings {
    pub fn from_config(config: &Config) -> Self {
        let r = &config.retrieval;
        Self {
            hybrid: HybridParams {
                alpha: r.hybrid_alpha,
                candidate_k_keyword: r.candidate_k_keyword,
                candidate_k_vector: r.candidate_k_vector,
            },
            top_k: r.top_k,
            min_relevance: r.min_relevance,
            budget: BudgetParams {
                max_chunks: r.max_chunks,
                token_budget: r.token_budget,
                min_fragment_tokens: r.min_fragment_tokens,
            },
            search_timeout: Duration::from_secs(r.search_timeout_secs),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            embed_retry: config.embedding.retry.policy(),
        }
    }
}

/// Fragments selected for a query, plus whether retrieval was degraded.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub fragments: Vec<ContextFragment>,
    pub degraded: bool,
}

pub struct ContextRetriever {
    backend: Arc<dyn SearchBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: RetrievalSettings,
}

impl ContextRetriever {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            backend,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Retrieve context with the configured chunk and token limits.
    pub async fn retrieve(&self, query: &str) -> Result<RetrievedContext, RagError> {
        let budget = self.settings.budget;
        self.retrieve_context(query, budget.max_chunks, budget.token_budget)
            .await
    }

    pub async fn retrieve_context(
        &self,
        query: &str,
        max_chunks: usize,
        token_budget: usize,
    ) -> Result<RetrievedContext, RagError> {
        let response = self
            .search(query, SearchFilters::default(), self.settings.top_k)
            .await?;

        let relevant: Vec<_> = response
            .results
            .iter()
            .filter(|r| {
                !response.vector_searched
                    || r.similarity
                        .is_some_and(|s| s >= self.settings.min_relevance)
            })
            .collect();
        debug!(
            hits = response.results.len(),
            relevant = relevant.len(),
            degraded = response.degraded,
            "hybrid search complete"
        );
        if relevant.is_empty() {
            return Ok(RetrievedContext {
                fragments: Vec::new(),
                degraded: response.degraded,
            });
        }

        let ids: Vec<String> = relevant.iter().map(|r| r.chunk_id.clone()).collect();
        let mut by_id: HashMap<String, Chunk> = self
            .backend
            .get_chunks(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let ranked: Vec<RankedChunk> = relevant
            .iter()
            .filter_map(|r| {
                by_id.remove(&r.chunk_id).map(|chunk| RankedChunk {
                    chunk,
                    score: r.score,
                    rank: r.rank,
                })
            })
            .collect();

        let params = BudgetParams {
            max_chunks,
            token_budget,
            min_fragment_tokens: self.settings.budget.min_fragment_tokens,
        };
        Ok(RetrievedContext {
            fragments: select_fragments(ranked, params),
            degraded: response.degraded,
        })
    }

    /// Hybrid search for `query` with per-channel deadlines.
    pub async fn search(
        &self,
        query: &str,
        filters: SearchFilters,
        top_k: usize,
    ) -> Result<SearchResponse, RagError> {
        let query_vec = self.embed_query(query).await?;
        let timed = TimedBackend {
            inner: self.backend.as_ref(),
            timeout: self.settings.search_timeout,
        };
        let request = SearchRequest {
            query_text: query,
            query_vec: query_vec.as_deref(),
            top_k,
            filters,
            params: self.settings.hybrid.clone(),
        };
        Ok(hybrid_search(&timed, &request).await?)
    }

    /// `None` when embeddings are disabled (keyword-only retrieval).
    async fn embed_query(&self, query: &str) -> Result<Option<Vec<f32>>, RagError> {
        if self.embedder.dims() == 0 {
            return Ok(None);
        }
        let texts = vec![query.to_string()];
        let vectors = self
            .settings
            .embed_retry
            .run("embed_query", self.settings.embed_timeout, || {
                self.embedder.embed(&texts)
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "query embedding failed");
                RagError::RetrievalUnavailable(format!("query embedding failed: {}", e))
            })?;
        vectors
            .into_iter()
            .next()
            .map(Some)
            .ok_or_else(|| RagError::RetrievalUnavailable("empty embedding response".to_string()))
    }
}

/// Applies a deadline to each search call of the wrapped backend.
struct TimedBackend<'a> {
    inner: &'a dyn SearchBackend,
    timeout: Duration,
}

impl TimedBackend<'_> {
    async fn bounded<T>(
        &self,
        channel: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("{} search timed out after {:?}", channel, self.timeout))?
    }
}

#[async_trait]
impl SearchBackend for TimedBackend<'_> {
    async fn upsert_chunks(&self, chunks: &[IndexedChunk]) -> Result<()> {
        self.inner.upsert_chunks(chunks).await
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        self.inner.get_chunks(ids).await
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.document_chunks(document_id).await
    }

    async fn indexed_hashes(
        &self,
        document_id: &str,
        dims: usize,
    ) -> Result<HashMap<String, String>> {
        self.inner.indexed_hashes(document_id, dims).await
    }

    async fn update_metadata(&self, chunks: &[Chunk]) -> Result<()> {
        self.inner.update_metadata(chunks).await
    }

    async fn prune_document(&self, document_id: &str, keep_below: i64) -> Result<usize> {
        self.inner.prune_document(document_id, keep_below).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_document(document_id).await
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        self.bounded("keyword", self.inner.keyword_search(query, limit, filters))
            .await
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        self.bounded("vector", self.inner.vector_search(query_vec, limit, filters))
            .await
    }

    async fn count_chunks(&self) -> Result<usize> {
        self.inner.count_chunks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowbridge_core::embedding::HashingProvider;
    use knowbridge_core::error::ProviderError;
    use knowbridge_core::models::{ChunkMetadata, SourceChunk};
    use knowbridge_core::store::memory::InMemoryBackend;

    struct FailingEmbedder(ProviderError);

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            1024
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(self.0.clone())
        }
    }

    fn settings() -> RetrievalSettings {
        RetrievalSettings {
            hybrid: HybridParams::default(),
            top_k: 10,
            min_relevance: 0.4,
            budget: BudgetParams {
                max_chunks: 5,
                token_budget: 500,
                min_fragment_tokens: 3,
            },
            search_timeout: Duration::from_secs(5),
            embed_timeout: Duration::from_secs(5),
            embed_retry: RetryPolicy::none(),
        }
    }

    async fn seeded(embedder: &HashingProvider, docs: &[(&str, i64, &str)]) -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        let batch: Vec<IndexedChunk> = docs
            .iter()
            .map(|(doc, seq, text)| IndexedChunk {
                chunk: Chunk::from_source(
                    doc,
                    &SourceChunk {
                        sequence_index: *seq,
                        text: text.to_string(),
                        metadata: ChunkMetadata {
                            source_title: Some(format!("{}.md", doc)),
                            ..Default::default()
                        },
                    },
                ),
                vector: embedder.embed_text(text),
            })
            .collect();
        backend.upsert_chunks(&batch).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_retrieves_and_merges_adjacent() {
        let embedder = HashingProvider::new(1024);
        let backend = seeded(
            &embedder,
            &[
                ("vpn", 0, "Install the VPN client from the portal."),
                ("vpn", 1, "Connect the VPN client with your badge id."),
                ("lunch", 0, "The cafeteria opens at noon."),
            ],
        )
        .await;
        let retriever = ContextRetriever::new(backend, Arc::new(embedder), settings());

        let ctx = retriever.retrieve("VPN client").await.unwrap();
        assert!(!ctx.degraded);
        assert_eq!(ctx.fragments.len(), 1);
        assert_eq!(ctx.fragments[0].source_title, "vpn.md");
        assert_eq!(ctx.fragments[0].chunk_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_relevant_is_empty_not_error() {
        let embedder = HashingProvider::new(1024);
        let backend = seeded(&embedder, &[("lunch", 0, "The cafeteria opens at noon.")]).await;
        let retriever = ContextRetriever::new(backend, Arc::new(embedder), settings());
        let ctx = retriever.retrieve("kubernetes rollout").await.unwrap();
        assert!(ctx.fragments.is_empty());
    }

    #[tokio::test]
    async fn test_vector_outage_is_degraded_keyword_only() {
        let embedder = HashingProvider::new(1024);
        let backend = seeded(&embedder, &[("vpn", 0, "Install the VPN client.")]).await;
        backend.set_vector_available(false);
        let retriever = ContextRetriever::new(backend, Arc::new(embedder), settings());
        let ctx = retriever.retrieve("vpn").await.unwrap();
        assert!(ctx.degraded);
        assert_eq!(ctx.fragments.len(), 1);
    }

    #[tokio::test]
    async fn test_query_embedding_failure_is_retrieval_unavailable() {
        let embedder = HashingProvider::new(1024);
        let backend = seeded(&embedder, &[("vpn", 0, "Install the VPN client.")]).await;
        let retriever = ContextRetriever::new(
            backend,
            Arc::new(FailingEmbedder(ProviderError::Unavailable("down".into()))),
            settings(),
        );
        assert!(matches!(
            retriever.retrieve("vpn").await,
            Err(RagError::RetrievalUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_token_budget_respected() {
        let embedder = HashingProvider::new(1024);
        let long = "Benefits enrollment opens in May. ".repeat(20);
        let backend = seeded(
            &embedder,
            &[("a", 0, &long), ("b", 0, &long), ("c", 0, &long)],
        )
        .await;
        let retriever = ContextRetriever::new(backend, Arc::new(embedder), settings());
        for budget in [0, 10, 50, 200, 400] {
            let ctx = retriever
                .retrieve_context("benefits enrollment", 5, budget)
                .await
                .unwrap();
            let used: usize = ctx.fragments.iter().map(|f| f.estimated_tokens).sum();
            assert!(used <= budget);
        }
    }
}
