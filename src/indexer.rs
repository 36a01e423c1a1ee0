//! Document indexing: chunks in, embedded and searchable chunks out.
//!
//! # Pipeline
//!
//! ```text
//! DocumentSource ─▶ hash check ─▶ batches ─▶ embed (retry) ─▶ upsert ─▶ prune
//!                                   │  buffer_unordered(workers)
//!                                   └─ failed batch → halves → … → single chunk
//! ```
//!
//! - Chunk ids are deterministic, so upserts overwrite and re-indexing is
//!   idempotent. After the upserts, chunks at or past the new chunk count
//!   are pruned so the index holds exactly the current chunk set.
//! - Chunks whose stored hash matches (and whose vector has the provider's
//!   dimension) are not re-embedded. If only their metadata changed, the
//!   metadata is rewritten in place and the stored vector is kept.
//! - A batch that still fails after retries is split in halves down to
//!   single chunks; single chunks that fail are reported, the rest proceed.
//! - An upsert rejected with [`BatchTooLarge`] is split the same way.
//! - A vector of the wrong dimension aborts the document.
//! - With the embedding provider disabled, chunks are stored without
//!   vectors and remain keyword-searchable.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use knowbridge_core::embedding::EmbeddingProvider;
use knowbridge_core::error::{BatchTooLarge, ProviderError};
use knowbridge_core::models::{Chunk, ChunkMetadata, IndexedChunk};
use knowbridge_core::store::SearchBackend;

use crate::config::Config;
use crate::error::RagError;
use crate::retry::RetryPolicy;
use crate::sources::DocumentSource;

/// Batch sizing, parallelism, and embedding retry settings.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub max_payload_bytes: usize,
    pub avg_chunk_chars: usize,
    pub max_batch_size: usize,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub embed_timeout: Duration,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_payload_bytes: config.indexing.max_payload_bytes,
            avg_chunk_chars: config.indexing.avg_chunk_chars,
            max_batch_size: config.indexing.max_batch_size,
            workers: config.indexing.workers,
            retry: config.embedding.retry.policy(),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
        }
    }
}

/// Outcome of indexing one document.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IndexReport {
    pub document_id: String,
    /// Chunks of the document that are current in the index.
    pub chunks_indexed: usize,
    /// Chunks sent to the embedding provider in this run.
    pub embedded: usize,
    /// Chunks skipped because their content hash and metadata were unchanged.
    pub unchanged: usize,
    /// Unchanged chunks whose metadata was rewritten without re-embedding.
    pub relabeled: usize,
    /// Stale chunks removed from the end of the document.
    pub pruned: usize,
    /// Chunk ids that could not be embedded.
    pub failures: Vec<String>,
}

/// `clamp(max_payload_bytes / avg_chunk_bytes, 1, max_batch_size)`.
pub fn compute_batch_size(max_payload_bytes: usize, avg_chunk_bytes: usize, max_batch_size: usize) -> usize {
    (max_payload_bytes / avg_chunk_bytes.max(1)).clamp(1, max_batch_size.max(1))
}

#[derive(Default)]
struct BatchOutcome {
    stored: usize,
    failures: Vec<String>,
}

pub struct IndexingPipeline {
    source: Arc<dyn DocumentSource>,
    backend: Arc<dyn SearchBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: IndexSettings,
}

impl IndexingPipeline {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        backend: Arc<dyn SearchBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            source,
            backend,
            embedder,
            settings,
        }
    }

    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.source
    }

    /// Index (or re-index) one document.
    pub async fn index_document(&self, document_id: &str) -> Result<IndexReport, RagError> {
        let source_chunks = self
            .source
            .get_chunks(document_id)
            .await?
            .ok_or_else(|| RagError::DocumentNotFound(document_id.to_string()))?;

        let chunks: Vec<Chunk> = source_chunks
            .iter()
            .map(|sc| Chunk::from_source(document_id, sc))
            .collect();
        let total = chunks.len();
        let dims = self.embedder.dims();

        let mut pending = Vec::new();
        let mut relabel = Vec::new();
        let mut unchanged = 0;
        if dims == 0 {
            pending = chunks;
        } else {
            let hashes = self.backend.indexed_hashes(document_id, dims).await?;
            let stored: HashMap<String, ChunkMetadata> = self
                .backend
                .document_chunks(document_id)
                .await?
                .into_iter()
                .map(|c| (c.id, c.metadata))
                .collect();
            for chunk in chunks {
                if hashes.get(&chunk.id) != Some(&chunk.hash) {
                    pending.push(chunk);
                } else if stored.get(&chunk.id) != Some(&chunk.metadata) {
                    relabel.push(chunk);
                } else {
                    unchanged += 1;
                }
            }
        }
        // Same text, new title/page/mime: keep the stored vector.
        if !relabel.is_empty() {
            self.backend.update_metadata(&relabel).await?;
        }

        let avg_bytes = if pending.is_empty() {
            self.settings.avg_chunk_chars
        } else {
            pending.iter().map(|c| c.text.len()).sum::<usize>().div_ceil(pending.len())
        };
        let batch_size = compute_batch_size(
            self.settings.max_payload_bytes,
            avg_bytes,
            self.settings.max_batch_size,
        );

        let batches: Vec<Vec<Chunk>> = pending.chunks(batch_size).map(<[Chunk]>::to_vec).collect();
        let outcomes: Vec<Result<BatchOutcome, RagError>> = stream::iter(batches)
            .map(|batch| self.process_batch(batch))
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        let mut report = IndexReport {
            document_id: document_id.to_string(),
            unchanged,
            relabeled: relabel.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            let outcome = outcome?;
            report.embedded += outcome.stored;
            report.failures.extend(outcome.failures);
        }
        if dims == 0 {
            report.embedded = 0;
        }

        report.pruned = self
            .backend
            .prune_document(document_id, total as i64)
            .await?;
        report.chunks_indexed = total - report.failures.len();

        info!(
            document_id,
            chunks = total,
            embedded = report.embedded,
            unchanged = report.unchanged,
            relabeled = report.relabeled,
            pruned = report.pruned,
            failures = report.failures.len(),
            "indexed document"
        );
        Ok(report)
    }

    /// Index documents concurrently. Failures of one document do not affect
    /// the others.
    pub async fn index_many(&self, document_ids: &[String]) -> Vec<(String, Result<IndexReport, RagError>)> {
        stream::iter(document_ids.iter().cloned())
            .map(|id| async move {
                let result = self.index_document(&id).await;
                (id, result)
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await
    }

    /// Index every document the source lists.
    pub async fn index_all(&self) -> Result<Vec<(String, Result<IndexReport, RagError>)>, RagError> {
        let ids: Vec<String> = self
            .source
            .list_documents()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        Ok(self.index_many(&ids).await)
    }

    /// Remove a document and all of its chunks from the index.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RagError> {
        let removed = self.backend.delete_document(document_id).await?;
        info!(document_id, removed, "deleted document");
        Ok(removed)
    }

    /// Embed one batch (splitting on failure) and upsert what succeeded.
    async fn process_batch(&self, batch: Vec<Chunk>) -> Result<BatchOutcome, RagError> {
        let mut outcome = BatchOutcome::default();
        let embedded = if self.embedder.dims() == 0 {
            batch
                .into_iter()
                .map(|chunk| IndexedChunk {
                    chunk,
                    vector: Vec::new(),
                })
                .collect()
        } else {
            self.embed_with_split(&batch, &mut outcome.failures).await?
        };

        self.upsert_with_split(&embedded).await?;
        outcome.stored = embedded.len();
        Ok(outcome)
    }

    async fn embed_with_split(
        &self,
        batch: &[Chunk],
        failures: &mut Vec<String>,
    ) -> Result<Vec<IndexedChunk>, RagError> {
        let dims = self.embedder.dims();
        let mut done = Vec::with_capacity(batch.len());
        let mut work: Vec<&[Chunk]> = vec![batch];

        while let Some(slice) = work.pop() {
            let texts: Vec<String> = slice.iter().map(|c| c.text.clone()).collect();
            let result = self
                .settings
                .retry
                .run("embed", self.settings.embed_timeout, || self.embedder.embed(&texts))
                .await;

            match result {
                Ok(vectors) => {
                    if vectors.len() != slice.len() {
                        return Err(RagError::EmbeddingFailed(format!(
                            "provider returned {} vectors for {} inputs",
                            vectors.len(),
                            slice.len()
                        )));
                    }
                    for (chunk, vector) in slice.iter().zip(vectors) {
                        if vector.len() != dims {
                            return Err(RagError::EmbeddingFailed(format!(
                                "dimension mismatch for chunk {}: expected {}, got {}",
                                chunk.id,
                                dims,
                                vector.len()
                            )));
                        }
                        done.push(IndexedChunk {
                            chunk: chunk.clone(),
                            vector,
                        });
                    }
                }
                Err(ProviderError::Disabled) => {
                    return Err(RagError::EmbeddingFailed(
                        "embedding provider is disabled".to_string(),
                    ))
                }
                Err(e) if slice.len() == 1 => {
                    warn!(chunk_id = %slice[0].id, error = %e, "chunk failed to embed");
                    failures.push(slice[0].id.clone());
                }
                Err(e) => {
                    warn!(size = slice.len(), error = %e, "embedding batch failed, splitting");
                    let (left, right) = slice.split_at(slice.len() / 2);
                    work.push(right);
                    work.push(left);
                }
            }
        }
        Ok(done)
    }

    async fn upsert_with_split(&self, items: &[IndexedChunk]) -> Result<(), RagError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut work: Vec<&[IndexedChunk]> = vec![items];
        while let Some(slice) = work.pop() {
            match self.backend.upsert_chunks(slice).await {
                Ok(()) => {}
                Err(e) => match e.downcast_ref::<BatchTooLarge>() {
                    Some(too_large) if slice.len() > 1 => {
                        warn!(size = too_large.size, limit = too_large.limit, "upsert too large, splitting");
                        let (left, right) = slice.split_at(slice.len() / 2);
                        work.push(right);
                        work.push(left);
                    }
                    _ => return Err(RagError::Storage(e)),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use knowbridge_core::embedding::HashingProvider;
    use knowbridge_core::store::memory::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::sources::StaticDocumentSource;

    fn settings() -> IndexSettings {
        IndexSettings {
            max_payload_bytes: 1_000_000,
            avg_chunk_chars: 100,
            max_batch_size: 8,
            workers: 2,
            retry: RetryPolicy::none(),
            embed_timeout: Duration::from_secs(5),
        }
    }

    /// Rejects any batch containing the word "poison"; counts calls.
    struct PickyEmbedder {
        inner: HashingProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(ProviderError::InvalidInput("bad chunk".into()));
            }
            self.inner.embed(texts).await
        }
    }

    struct WrongDims;

    #[async_trait]
    impl EmbeddingProvider for WrongDims {
        fn model_name(&self) -> &str {
            "wrong"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    fn paragraphs(n: usize) -> String {
        (0..n)
            .map(|i| format!("Paragraph number {} about onboarding.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_compute_batch_size() {
        assert_eq!(compute_batch_size(1000, 100, 64), 10);
        assert_eq!(compute_batch_size(1000, 5000, 64), 1);
        assert_eq!(compute_batch_size(1_000_000, 10, 64), 64);
        assert_eq!(compute_batch_size(1000, 0, 64), 64);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent_and_skips_unchanged() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Guide", &paragraphs(5)).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = IndexingPipeline::new(
            source.clone(),
            backend.clone(),
            Arc::new(HashingProvider::new(32)),
            settings(),
        );

        let first = pipeline.index_document("d1").await.unwrap();
        let count = backend.count_chunks().await.unwrap();
        assert_eq!(first.chunks_indexed, count);
        assert!(first.failures.is_empty());

        let second = pipeline.index_document("d1").await.unwrap();
        assert_eq!(backend.count_chunks().await.unwrap(), count);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.unchanged, count);
    }

    #[tokio::test]
    async fn test_retitled_document_updates_metadata_without_reembedding() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Old Handbook", &paragraphs(3)).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let embedder = Arc::new(PickyEmbedder {
            inner: HashingProvider::new(32),
            calls: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(
            source.clone(),
            backend.clone(),
            embedder.clone(),
            settings(),
        );
        pipeline.index_document("d1").await.unwrap();
        let calls = embedder.calls.load(Ordering::SeqCst);

        source.put_text("d1", "New Handbook", &paragraphs(3)).unwrap();
        let report = pipeline.index_document("d1").await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.unchanged, 0);
        assert_eq!(report.relabeled, report.chunks_indexed);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);

        let chunks = backend.document_chunks("d1").await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks
            .iter()
            .all(|c| c.metadata.source_title.as_deref() == Some("New Handbook")));
        assert_eq!(backend.indexed_hashes("d1", 32).await.unwrap().len(), chunks.len());

        let again = pipeline.index_document("d1").await.unwrap();
        assert_eq!(again.relabeled, 0);
        assert_eq!(again.unchanged, again.chunks_indexed);
    }

    #[tokio::test]
    async fn test_shrunk_document_is_pruned() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Guide", &paragraphs(6)).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = IndexingPipeline::new(
            source.clone(),
            backend.clone(),
            Arc::new(HashingProvider::new(32)),
            settings(),
        );
        pipeline.index_document("d1").await.unwrap();
        let before = backend.count_chunks().await.unwrap();

        source.put_text("d1", "Guide", &paragraphs(2)).unwrap();
        let report = pipeline.index_document("d1").await.unwrap();
        let after = backend.count_chunks().await.unwrap();
        assert!(after < before);
        assert_eq!(report.pruned, before - after);
        assert_eq!(report.chunks_indexed, after);
    }

    #[tokio::test]
    async fn test_bad_chunk_is_isolated() {
        let source = Arc::new(StaticDocumentSource::new(10));
        let mut body = paragraphs(6);
        body.push_str("\n\nThis paragraph is poison.");
        source.put_text("d1", "Guide", &body).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let embedder = Arc::new(PickyEmbedder {
            inner: HashingProvider::new(32),
            calls: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(source, backend.clone(), embedder, settings());

        let report = pipeline.index_document("d1").await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            backend.count_chunks().await.unwrap(),
            report.chunks_indexed
        );
        assert!(report.chunks_indexed >= 6);
    }

    #[tokio::test]
    async fn test_backend_batch_limit_is_split() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Guide", &paragraphs(7)).unwrap();
        let backend = Arc::new(InMemoryBackend::new().with_max_batch(2));
        let pipeline = IndexingPipeline::new(
            source,
            backend.clone(),
            Arc::new(HashingProvider::new(32)),
            settings(),
        );
        let report = pipeline.index_document("d1").await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(backend.count_chunks().await.unwrap(), report.chunks_indexed);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Guide", "Some text.").unwrap();
        let pipeline = IndexingPipeline::new(
            source,
            Arc::new(InMemoryBackend::new()),
            Arc::new(WrongDims),
            settings(),
        );
        let err = pipeline.index_document("d1").await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn test_unknown_document_and_delete() {
        let source = Arc::new(StaticDocumentSource::new(10));
        source.put_text("d1", "Guide", &paragraphs(3)).unwrap();
        source.put_text("d2", "Other", &paragraphs(2)).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = IndexingPipeline::new(
            source,
            backend.clone(),
            Arc::new(HashingProvider::new(32)),
            settings(),
        );

        assert!(matches!(
            pipeline.index_document("missing").await,
            Err(RagError::DocumentNotFound(_))
        ));

        let results = pipeline.index_all().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let removed = pipeline.delete_document("d1").await.unwrap();
        assert!(removed > 0);
        assert!(backend.document_chunks("d1").await.unwrap().is_empty());
        assert!(!backend.document_chunks("d2").await.unwrap().is_empty());
    }
}
