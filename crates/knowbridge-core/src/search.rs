//! Hybrid (keyword + vector) retrieval over a [`SearchBackend`].
//!
//! The algorithm operates entirely through the backend trait. The caller
//! embeds the query and passes the vector in; this module only merges.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Run keyword search (`candidate_k_keyword`) and vector search
//!    (`candidate_k_vector`) concurrently.
//! 2. Min-max normalize each candidate list to `[0, 1]`.
//! 3. Merge by chunk id: `score = α × vector + (1 - α) × keyword`.
//! 4. Sort by score (desc), keyword score (desc), indexed_at (desc), id (asc).
//! 5. Truncate to `top_k` and assign 1-based ranks.
//!
//! # Degraded Modes
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | Empty query text | Keyword channel skipped, pure vector results |
//! | One channel fails | Results from the other, `degraded = true` |
//! | Every requested channel fails | [`RetrievalUnavailable`] |

use futures_util::future::join;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::RetrievalUnavailable;
use crate::store::{ChunkCandidate, SearchBackend, SearchFilters};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct HybridParams {
    /// Weight for vector vs keyword: `hybrid = α*vector + (1-α)*keyword`.
    pub alpha: f64,
    /// Number of keyword candidates to fetch.
    pub candidate_k_keyword: usize,
    /// Number of vector candidates to fetch.
    pub candidate_k_vector: usize,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            candidate_k_keyword: 50,
            candidate_k_vector: 50,
        }
    }
}

/// Inputs for a single hybrid search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query_text: &'a str,
    /// Pre-computed query embedding. `None` skips the vector channel.
    pub query_vec: Option<&'a [f32]>,
    pub top_k: usize,
    pub filters: SearchFilters,
    pub params: HybridParams,
}

/// Which channel(s) produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Vector,
    Keyword,
    Hybrid,
}

/// A ranked search hit. Ephemeral: lives for one retrieval call.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    /// Combined score in `[0.0, 1.0]`.
    pub score: f64,
    /// 1-based position after sorting.
    pub rank: usize,
    pub match_type: MatchType,
    /// Normalized keyword score (0.0 if absent from keyword candidates).
    pub keyword_score: f64,
    /// Normalized vector score (0.0 if absent from vector candidates).
    pub vector_score: f64,
    /// Raw cosine similarity, when the chunk was a vector candidate.
    pub similarity: Option<f64>,
    pub snippet: String,
    #[serde(skip)]
    pub indexed_at: i64,
}

/// Envelope returned by [`hybrid_search`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// True when one of the requested channels failed.
    pub degraded: bool,
    /// True when vector results participated in the merge.
    pub vector_searched: bool,
}

/// Run a hybrid search against a [`SearchBackend`].
pub async fn hybrid_search<B: SearchBackend + ?Sized>(
    backend: &B,
    req: &SearchRequest<'_>,
) -> Result<SearchResponse, RetrievalUnavailable> {
    let want_keyword = !req.query_text.trim().is_empty();
    let want_vector = req.query_vec.is_some();

    if !want_keyword && !want_vector {
        return Ok(SearchResponse::default());
    }

    let keyword_fut = async {
        if want_keyword {
            Some(
                backend
                    .keyword_search(req.query_text, req.params.candidate_k_keyword, &req.filters)
                    .await,
            )
        } else {
            None
        }
    };
    let vector_fut = async {
        match req.query_vec {
            Some(qv) => Some(
                backend
                    .vector_search(qv, req.params.candidate_k_vector, &req.filters)
                    .await,
            ),
            None => None,
        }
    };
    let (keyword_res, vector_res) = join(keyword_fut, vector_fut).await;

    let mut failures = Vec::new();
    let keyword_candidates = match keyword_res {
        Some(Ok(c)) => Some(c),
        Some(Err(e)) => {
            failures.push(format!("keyword search failed: {}", e));
            None
        }
        None => None,
    };
    let vector_candidates = match vector_res {
        Some(Ok(c)) => Some(c),
        Some(Err(e)) => {
            failures.push(format!("vector search failed: {}", e));
            None
        }
        None => None,
    };

    if keyword_candidates.is_none() && vector_candidates.is_none() {
        return Err(RetrievalUnavailable(failures.join("; ")));
    }

    let degraded = !failures.is_empty();
    let keyword_searched = keyword_candidates.is_some();
    let vector_searched = vector_candidates.is_some();
    let keyword_candidates = keyword_candidates.unwrap_or_default();
    let vector_candidates = vector_candidates.unwrap_or_default();

    let alpha = match (keyword_searched, vector_searched) {
        (true, true) => req.params.alpha,
        (true, false) => 0.0,
        _ => 1.0,
    };

    let mut results = merge(&keyword_candidates, &vector_candidates, alpha);
    results.truncate(req.top_k);
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }

    Ok(SearchResponse {
        results,
        degraded,
        vector_searched,
    })
}

/// Normalize, merge by chunk id, and sort candidates.
pub fn merge(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<SearchResult> {
    let norm_keyword = normalize_scores(keyword);
    let norm_vector = normalize_scores(vector);

    let mut merged: HashMap<&str, SearchResult> = HashMap::new();

    for (c, k) in &norm_keyword {
        merged
            .entry(c.chunk_id.as_str())
            .and_modify(|r| r.keyword_score = r.keyword_score.max(*k))
            .or_insert_with(|| SearchResult {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.clone(),
                score: 0.0,
                rank: 0,
                match_type: MatchType::Keyword,
                keyword_score: *k,
                vector_score: 0.0,
                similarity: None,
                snippet: c.snippet.clone(),
                indexed_at: c.indexed_at,
            });
    }

    for (c, v) in &norm_vector {
        merged
            .entry(c.chunk_id.as_str())
            .and_modify(|r| {
                if *v >= r.vector_score {
                    r.vector_score = *v;
                    r.similarity = Some(c.raw_score);
                }
                if r.match_type == MatchType::Keyword {
                    r.match_type = MatchType::Hybrid;
                }
            })
            .or_insert_with(|| SearchResult {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.clone(),
                score: 0.0,
                rank: 0,
                match_type: MatchType::Vector,
                keyword_score: 0.0,
                vector_score: *v,
                similarity: Some(c.raw_score),
                snippet: c.snippet.clone(),
                indexed_at: c.indexed_at,
            });
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|mut r| {
            r.score = alpha * r.vector_score + (1.0 - alpha) * r.keyword_score;
            r
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.keyword_score
                    .partial_cmp(&a.keyword_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.indexed_at.cmp(&a.indexed_at))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });

    results
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}
