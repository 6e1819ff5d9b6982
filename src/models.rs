//! Core data models used throughout Medsum.
//!
//! These types represent the KB documents, indexed chunks, and chat turns
//! that flow through the indexing, retrieval, and validation pipeline.

use serde::{Deserialize, Serialize};

/// A loaded KB source document before chunking.
#[derive(Debug, Clone)]
pub struct KbDocument {
    /// Display name of the origin file (basename).
    pub source: String,
    /// Page number when the source format has pages.
    pub page: Option<u32>,
    pub body: String,
}

/// A chunk of KB text with provenance and its embedding vector.
///
/// Owned exclusively by the index; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: String,
    pub source: String,
    pub page: Option<u32>,
    pub chunk_index: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub source: String,
    pub page: Option<u32>,
    pub chunk_index: i64,
    pub text: String,
    pub score: f32,
}

/// A single conversation turn; request history is ordered most-recent-last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}
