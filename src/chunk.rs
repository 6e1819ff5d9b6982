//! Overlapping text chunker.
//!
//! Splits KB document bodies into windows of `chunk_size` characters with
//! `chunk_overlap` trailing context carried into the next window. Split
//! points prefer whitespace so chunks do not cut words when a boundary is
//! available in the back half of the window.
//!
//! Chunk indices are contiguous per document starting at 0, and the output
//! is fully deterministic for a given input.

use crate::models::KbDocument;

/// A chunk before embedding: provenance plus text, no vector yet.
#[derive(Debug, Clone)]
pub struct DraftChunk {
    pub source: String,
    pub page: Option<u32>,
    pub chunk_index: i64,
    pub text: String,
}

/// Chunk every document, preserving provenance.
pub fn chunk_documents(
    docs: &[KbDocument],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<DraftChunk> {
    let mut drafts = Vec::new();
    for doc in docs {
        for (i, text) in split_text(&doc.body, chunk_size, chunk_overlap)
            .into_iter()
            .enumerate()
        {
            drafts.push(DraftChunk {
                source: doc.source.clone(),
                page: doc.page,
                chunk_index: i as i64,
                text,
            });
        }
    }
    drafts
}

/// Split text into overlapping windows of at most `chunk_size` characters.
///
/// Requires `chunk_overlap < chunk_size` (enforced at config load).
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    if chars.is_empty() || chunk_size == 0 {
        return chunks;
    }

    let mut start = 0usize;
    loop {
        let mut end = (start + chunk_size).min(chars.len());

        // Prefer a whitespace split point, but only in the back half of the
        // window so pathological inputs cannot shrink chunks to nothing.
        if end < chars.len() {
            if let Some(pos) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if pos + 1 > chunk_size / 2 {
                    end = start + pos + 1;
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }

        // Carry trailing context; monotonic progress even after a short
        // whitespace-adjusted window.
        let next = end.saturating_sub(chunk_overlap);
        start = if next > start { next } else { end };
    }

    chunks
}
