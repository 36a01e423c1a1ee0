//! In-memory [`SearchBackend`] for tests and single-process deployments.
//!
//! Chunks live in a `HashMap` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search is BM25 over
//! [`tokenize`]d text. Either channel can be switched off to simulate a
//! backend outage, and an optional per-request upsert limit mimics hosted
//! search services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, tokenize};
use crate::error::BatchTooLarge;
use crate::models::{Chunk, IndexedChunk};

use super::{make_snippet, ChunkCandidate, SearchBackend, SearchFilters};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
    tokens: Vec<String>,
}

/// In-memory search backend.
pub struct InMemoryBackend {
    chunks: RwLock<HashMap<String, StoredChunk>>,
    max_batch: Option<usize>,
    keyword_available: AtomicBool,
    vector_available: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            max_batch: None,
            keyword_available: AtomicBool::new(true),
            vector_available: AtomicBool::new(true),
        }
    }

    /// Reject upserts larger than `limit` chunks with [`BatchTooLarge`].
    pub fn with_max_batch(mut self, limit: usize) -> Self {
        self.max_batch = Some(limit.max(1));
        self
    }

    /// Toggle the keyword channel (simulated outage when `false`).
    pub fn set_keyword_available(&self, available: bool) {
        self.keyword_available.store(available, Ordering::SeqCst);
    }

    /// Toggle the vector channel (simulated outage when `false`).
    pub fn set_vector_available(&self, available: bool) {
        self.vector_available.store(available, Ordering::SeqCst);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, StoredChunk>>> {
        self.chunks
            .read()
            .map_err(|_| anyhow!("in-memory backend lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, StoredChunk>>> {
        self.chunks
            .write()
            .map_err(|_| anyhow!("in-memory backend lock poisoned"))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_desc(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[async_trait]
impl SearchBackend for InMemoryBackend {
    async fn upsert_chunks(&self, chunks: &[IndexedChunk]) -> Result<()> {
        if let Some(limit) = self.max_batch {
            if chunks.len() > limit {
                return Err(BatchTooLarge {
                    size: chunks.len(),
                    limit,
                }
                .into());
            }
        }
        let mut stored = self.write()?;
        for ic in chunks {
            stored.insert(
                ic.chunk.id.clone(),
                StoredChunk {
                    chunk: ic.chunk.clone(),
                    vector: ic.vector.clone(),
                    tokens: tokenize(&ic.chunk.text),
                },
            );
        }
        Ok(())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let stored = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|sc| sc.chunk.clone()))
            .collect())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let stored = self.read()?;
        let mut chunks: Vec<Chunk> = stored
            .values()
            .filter(|sc| sc.chunk.document_id == document_id)
            .map(|sc| sc.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.sequence_index);
        Ok(chunks)
    }

    async fn indexed_hashes(
        &self,
        document_id: &str,
        dims: usize,
    ) -> Result<HashMap<String, String>> {
        let stored = self.read()?;
        Ok(stored
            .values()
            .filter(|sc| sc.chunk.document_id == document_id && sc.vector.len() == dims)
            .map(|sc| (sc.chunk.id.clone(), sc.chunk.hash.clone()))
            .collect())
    }

    async fn update_metadata(&self, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.write()?;
        for chunk in chunks {
            if let Some(sc) = stored.get_mut(&chunk.id) {
                sc.chunk.metadata = chunk.metadata.clone();
                sc.chunk.indexed_at = chunk.indexed_at;
            }
        }
        Ok(())
    }

    async fn prune_document(&self, document_id: &str, keep_below: i64) -> Result<usize> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|_, sc| {
            !(sc.chunk.document_id == document_id && sc.chunk.sequence_index >= keep_below)
        });
        Ok(before - stored.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|_, sc| sc.chunk.document_id != document_id);
        Ok(before - stored.len())
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        if !self.keyword_available.load(Ordering::SeqCst) {
            return Err(anyhow!("keyword index unavailable"));
        }
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.read()?;
        let docs: Vec<&StoredChunk> = stored
            .values()
            .filter(|sc| filters.matches(&sc.chunk))
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let n = docs.len() as f64;
        let avg_len = docs.iter().map(|d| d.tokens.len()).sum::<usize>() as f64 / n;
        let df: HashMap<&str, usize> = terms
            .iter()
            .map(|t| {
                let count = docs.iter().filter(|d| d.tokens.contains(t)).count();
                (t.as_str(), count)
            })
            .collect();

        let mut candidates: Vec<ChunkCandidate> = docs
            .iter()
            .filter_map(|d| {
                let len = d.tokens.len() as f64;
                let mut score = 0.0;
                for t in &terms {
                    let tf = d.tokens.iter().filter(|tok| *tok == t).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df_t = df.get(t.as_str()).copied().unwrap_or(0) as f64;
                    let idf = (1.0 + (n - df_t + 0.5) / (df_t + 0.5)).ln();
                    let norm = 1.0 - BM25_B + BM25_B * len / avg_len.max(1.0);
                    score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                }
                if score > 0.0 {
                    Some(ChunkCandidate {
                        chunk_id: d.chunk.id.clone(),
                        document_id: d.chunk.document_id.clone(),
                        raw_score: score,
                        snippet: make_snippet(&d.chunk.text),
                        indexed_at: d.chunk.indexed_at,
                    })
                } else {
                    None
                }
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        if !self.vector_available.load(Ordering::SeqCst) {
            return Err(anyhow!("vector index unavailable"));
        }
        let stored = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = stored
            .values()
            .filter(|sc| !sc.vector.is_empty() && filters.matches(&sc.chunk))
            .map(|sc| ChunkCandidate {
                chunk_id: sc.chunk.id.clone(),
                document_id: sc.chunk.document_id.clone(),
                raw_score: cosine_similarity(query_vec, &sc.vector) as f64,
                snippet: make_snippet(&sc.chunk.text),
                indexed_at: sc.chunk.indexed_at,
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count_chunks(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
