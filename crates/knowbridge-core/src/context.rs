//! Token-budgeted context selection.
//!
//! Turns ranked, relevance-filtered chunks into the [`ContextFragment`]s
//! that get rendered into a prompt.
//!
//! # Selection
//!
//! 1. Walk chunks in rank order, reserving `estimate_tokens(text) + 1`
//!    tokens per fragment (the extra token covers the separator added when
//!    adjacent fragments are merged).
//! 2. Stop at `max_chunks`.
//! 3. The first chunk that would overflow the budget is cut at the last
//!    sentence boundary that fits. If the cut leaves fewer than
//!    `min_fragment_tokens`, it is dropped. Selection ends there.
//! 4. Fragments of the same document with adjacent `sequence_index` are
//!    merged into one (best score, earliest rank).
//!
//! The sum of `estimated_tokens` over the returned fragments never exceeds
//! `token_budget`.

use serde::Serialize;

use crate::chunk::CHARS_PER_TOKEN;
use crate::models::Chunk;

/// Tokens reserved per fragment for the merge separator.
const FRAGMENT_OVERHEAD_TOKENS: usize = 1;

/// Separator placed between merged adjacent chunks.
const MERGE_SEPARATOR: &str = "\n\n";

/// A piece of retrieved context ready to be cited in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFragment {
    pub document_id: String,
    /// Chunk ids covered by this fragment, in sequence order.
    pub chunk_ids: Vec<String>,
    pub seq_start: i64,
    pub seq_end: i64,
    pub source_title: String,
    pub text: String,
    pub score: f64,
    pub rank: usize,
    pub estimated_tokens: usize,
}

/// Limits applied by [`select_fragments`].
#[derive(Debug, Clone, Copy)]
pub struct BudgetParams {
    pub max_chunks: usize,
    pub token_budget: usize,
    pub min_fragment_tokens: usize,
}

/// A relevance-filtered chunk with its search score and rank.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub rank: usize,
}

/// Rough token estimate: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Greedily select and merge fragments within the budget.
///
/// `ranked` must already be in rank order.
pub fn select_fragments(ranked: Vec<RankedChunk>, params: BudgetParams) -> Vec<ContextFragment> {
    let mut selected = Vec::new();
    let mut used = 0usize;

    for rc in ranked {
        if selected.len() >= params.max_chunks {
            break;
        }
        let cost = estimate_tokens(&rc.chunk.text) + FRAGMENT_OVERHEAD_TOKENS;
        if used + cost <= params.token_budget {
            used += cost;
            selected.push(fragment_from(&rc, rc.chunk.text.clone()));
            continue;
        }

        let remaining = params
            .token_budget
            .saturating_sub(used + FRAGMENT_OVERHEAD_TOKENS);
        if let Some(cut) = truncate_at_sentence(&rc.chunk.text, remaining) {
            if estimate_tokens(cut) >= params.min_fragment_tokens.max(1) {
                selected.push(fragment_from(&rc, cut.to_string()));
            }
        }
        break;
    }

    merge_adjacent(selected)
}

fn fragment_from(rc: &RankedChunk, text: String) -> ContextFragment {
    ContextFragment {
        document_id: rc.chunk.document_id.clone(),
        chunk_ids: vec![rc.chunk.id.clone()],
        seq_start: rc.chunk.sequence_index,
        seq_end: rc.chunk.sequence_index,
        source_title: rc.chunk.citation_source(),
        estimated_tokens: estimate_tokens(&text),
        text,
        score: rc.score,
        rank: rc.rank,
    }
}

/// Longest prefix of `text` within `max_tokens` that ends on a sentence
/// boundary (`.`, `!`, `?` followed by whitespace or end of text, or a
/// newline). Returns the whole text if it already fits, `None` if no
/// boundary fits.
pub fn truncate_at_sentence(text: &str, max_tokens: usize) -> Option<&str> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if text.chars().count() <= max_chars {
        return Some(text);
    }
    let window_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..window_end];

    let mut best: Option<usize> = None;
    for (i, c) in window.char_indices() {
        let end = i + c.len_utf8();
        match c {
            '\n' => best = Some(i),
            '.' | '!' | '?' => {
                let next = text[end..].chars().next();
                if next.map_or(true, char::is_whitespace) {
                    best = Some(end);
                }
            }
            _ => {}
        }
    }

    best.map(|end| text[..end].trim_end()).filter(|s| !s.is_empty())
}

fn adjacent(a: &ContextFragment, b: &ContextFragment) -> bool {
    a.document_id == b.document_id && (a.seq_end + 1 == b.seq_start || b.seq_end + 1 == a.seq_start)
}

fn combine(a: ContextFragment, b: ContextFragment) -> ContextFragment {
    let (first, second) = if a.seq_start <= b.seq_start { (a, b) } else { (b, a) };
    let text = format!("{}{}{}", first.text, MERGE_SEPARATOR, second.text);
    let mut chunk_ids = first.chunk_ids;
    chunk_ids.extend(second.chunk_ids);
    ContextFragment {
        document_id: first.document_id,
        chunk_ids,
        seq_start: first.seq_start,
        seq_end: second.seq_end,
        source_title: first.source_title,
        estimated_tokens: estimate_tokens(&text),
        text,
        score: first.score.max(second.score),
        rank: first.rank.min(second.rank),
    }
}

/// Merge same-document fragments with adjacent sequence indices until no
/// pair is adjacent, then restore rank order.
pub fn merge_adjacent(fragments: Vec<ContextFragment>) -> Vec<ContextFragment> {
    let mut out: Vec<ContextFragment> = Vec::with_capacity(fragments.len());
    for frag in fragments {
        let mut pending = frag;
        while let Some(i) = out.iter().position(|f| adjacent(f, &pending)) {
            let existing = out.swap_remove(i);
            pending = combine(existing, pending);
        }
        out.push(pending);
    }
    out.sort_by_key(|f| f.rank);
    out
}
