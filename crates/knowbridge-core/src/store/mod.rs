//! Search backend abstraction.
//!
//! The [`SearchBackend`] trait covers both halves of the index: the chunk
//! store (chunk id → text and metadata) and the search index (keyword and
//! vector retrieval over those chunks). Backends are selected from
//! configuration at startup; the hybrid merge in [`crate::search`] only
//! ever talks to this trait.
//!
//! Implementations must be `Send + Sync`. Writers use last-write-wins
//! upserts keyed by chunk id, so no cross-writer locking is required.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{Chunk, IndexedChunk};

/// Maximum snippet length carried by search candidates.
pub const SNIPPET_CHARS: usize = 240;

/// A candidate chunk returned from keyword or vector search.
///
/// Carries enough information to normalize, merge, and tie-break without
/// another backend round-trip.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw backend score (BM25 relevance or cosine similarity). Higher is better.
    pub raw_score: f64,
    pub snippet: String,
    /// Unix timestamp (milliseconds) the chunk was indexed, for recency tie-breaks.
    pub indexed_at: i64,
}

/// Optional restrictions applied by both search channels.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub document_id: Option<String>,
    pub mime_type: Option<String>,
}

impl SearchFilters {
    /// Whether a chunk passes every configured filter.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(doc) = &self.document_id {
            if &chunk.document_id != doc {
                return false;
            }
        }
        if let Some(mime) = &self.mime_type {
            if &chunk.metadata.mime_type != mime {
                return false;
            }
        }
        true
    }
}

/// Abstract chunk store and hybrid search index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_chunks`](SearchBackend::upsert_chunks) | Insert or overwrite chunks with their vectors |
/// | [`get_chunks`](SearchBackend::get_chunks) | Fetch chunks by id |
/// | [`document_chunks`](SearchBackend::document_chunks) | All chunks of a document in sequence order |
/// | [`indexed_hashes`](SearchBackend::indexed_hashes) | Content hashes of a document's embedded chunks |
/// | [`update_metadata`](SearchBackend::update_metadata) | Rewrite chunk metadata, keeping text and vector |
/// | [`prune_document`](SearchBackend::prune_document) | Drop chunks past a sequence index |
/// | [`delete_document`](SearchBackend::delete_document) | Drop every chunk of a document |
/// | [`keyword_search`](SearchBackend::keyword_search) | Lexical search |
/// | [`vector_search`](SearchBackend::vector_search) | Cosine similarity search |
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Insert or overwrite chunks and their vectors, keyed by chunk id.
    ///
    /// Backends with a per-request limit return
    /// [`BatchTooLarge`](crate::error::BatchTooLarge) wrapped in the error.
    async fn upsert_chunks(&self, chunks: &[IndexedChunk]) -> Result<()>;

    /// Fetch chunks by id. Unknown ids are skipped; order is unspecified.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// All chunks of a document, ordered by `sequence_index`.
    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Map of chunk id → content hash for the document's chunks that carry
    /// a vector of `dims` dimensions.
    async fn indexed_hashes(&self, document_id: &str, dims: usize)
        -> Result<HashMap<String, String>>;

    /// Overwrite the metadata and `indexed_at` of chunks already stored
    /// under the same ids. Text, hash, and vector are left untouched;
    /// unknown ids are skipped.
    async fn update_metadata(&self, chunks: &[Chunk]) -> Result<()>;

    /// Delete chunks of `document_id` with `sequence_index >= keep_below`.
    /// Returns the number of chunks removed.
    async fn prune_document(&self, document_id: &str, keep_below: i64) -> Result<usize>;

    /// Delete every chunk of `document_id`. Returns the number removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// Lexical search, best match first.
    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Vector similarity search, most similar first.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Total number of indexed chunks.
    async fn count_chunks(&self) -> Result<usize>;
}

/// Truncate text to [`SNIPPET_CHARS`] characters.
pub fn make_snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}
