//! Paragraph-boundary text chunker.
//!
//! Splits a document body into [`SourceChunk`]s that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph
//! boundaries (`\n\n`) to keep each chunk semantically coherent.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using [`CHARS_PER_TOKEN`].
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs into a buffer until adding the next one would
//!    exceed `max_chars`, then flush the buffer as a chunk.
//! 4. A single paragraph longer than `max_chars` is hard-split at the
//!    nearest newline or space boundary.
//!
//! Each chunk records its byte offset into the original body.
//!
//! # Example
//!
//! ```rust
//! use knowbridge_core::chunk::chunk_text;
//! use knowbridge_core::models::ChunkMetadata;
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", 700, &ChunkMetadata::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].sequence_index, 0);
//! ```

use crate::models::{ChunkMetadata, SourceChunk};

/// Approximate characters-per-token ratio (4 chars ≈ 1 token).
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Every chunk inherits `metadata` with its own `offset` filled in.
/// Sequence indices are contiguous from 0. Whitespace-only text yields no
/// chunks.
pub fn chunk_text(text: &str, max_tokens: usize, metadata: &ChunkMetadata) -> Vec<SourceChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut out = Chunker {
        base: text,
        metadata,
        chunks: Vec::new(),
    };

    let mut buf = String::new();
    let mut buf_offset = 0usize;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let para_offset = out.offset_of(trimmed);

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !buf.is_empty() {
            out.push(&buf, buf_offset);
            buf.clear();
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split = split_point(remaining, max_chars);
                let piece = &remaining[..split];
                if !piece.trim().is_empty() {
                    let piece_trimmed = piece.trim();
                    let off = out.offset_of(piece_trimmed);
                    out.push(piece_trimmed, off);
                }
                remaining = &remaining[split..];
            }
        } else {
            if buf.is_empty() {
                buf_offset = para_offset;
            } else {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        out.push(&buf, buf_offset);
    }

    out.chunks
}

struct Chunker<'a> {
    base: &'a str,
    metadata: &'a ChunkMetadata,
    chunks: Vec<SourceChunk>,
}

impl Chunker<'_> {
    /// Byte offset of a subslice of `base`.
    fn offset_of(&self, slice: &str) -> usize {
        (slice.as_ptr() as usize).saturating_sub(self.base.as_ptr() as usize)
    }

    fn push(&mut self, text: &str, offset: usize) {
        let mut metadata = self.metadata.clone();
        metadata.offset = Some(offset as i64);
        self.chunks.push(SourceChunk {
            sequence_index: self.chunks.len() as i64,
            text: text.to_string(),
            metadata,
        });
    }
}

/// Byte index at which to hard-split an oversized paragraph.
///
/// Prefers the last newline, then the last space, inside the window;
/// always makes progress by at least one character.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let window_end = snap_to_char_boundary(s, max_chars);
    let window = &s[..window_end];
    let split = window
        .rfind('\n')
        .or_else(|| window.rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(window_end);
    if split == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        split
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
