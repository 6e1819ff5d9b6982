//! KB index build/load management.
//!
//! Decides whether the persisted vector index under `index_dir` can be
//! reused (fast path) or must be rebuilt (slow path), and persists rebuild
//! results atomically.
//!
//! # Freshness
//!
//! An index is fresh for a `(glob, embedding model)` pair iff the persisted
//! `meta.json` fingerprint equals the freshly computed corpus fingerprint
//! AND the stored embedding model matches the requested one. Anything else
//! — unreadable metadata, mismatch, corrupt body — falls through to rebuild
//! without surfacing an error.
//!
//! # Persistence
//!
//! The index directory holds `index.json` (chunks + vectors) and a
//! `meta.json` sibling. Writes are staged: both files land in a staging
//! directory (body before metadata), which is then renamed over
//! `index_dir`, so a reader never observes metadata without a matching
//! body. One writer per `index_dir` at a time — concurrent processes
//! targeting the same directory must be prevented by deployment convention.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk::chunk_documents;
use crate::config::ChunkingConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::models::{IndexedChunk, KbDocument, ScoredChunk};

pub const INDEX_FILE: &str = "index.json";
pub const META_FILE: &str = "meta.json";

/// Chunks per embedding request on the slow path.
const EMBED_BATCH: usize = 64;

/// Persisted descriptor of a built index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMeta {
    pub kb_fingerprint: String,
    pub embedding_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Build completion time, epoch seconds.
    pub built_at: i64,
}

#[derive(Serialize, Deserialize)]
struct IndexBody {
    chunks: Vec<IndexedChunk>,
}

/// In-memory similarity index over embedded KB chunks.
pub struct VectorIndex {
    chunks: Vec<IndexedChunk>,
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Return the `k` nearest chunks by cosine similarity, most-relevant
    /// first. Ties break on `(source, chunk_index)` so results are
    /// deterministic for an unchanged index and query.
    pub fn search(&self, query_vec: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .map(|c| ScoredChunk {
                source: c.source.clone(),
                page: c.page,
                chunk_index: c.chunk_index,
                text: c.text.clone(),
                score: cosine_similarity(query_vec, &c.vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        scored.truncate(k);
        scored
    }
}

/// Last-produced status of the index manager, served by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Initializing,
    Loaded,
    Built,
    Empty,
    IndexError,
}

/// Status report paired with an index build or load attempt.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub status: IndexStatus,
    /// `"disk"` for fast-path loads, `"rebuild"` for slow-path builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_docs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexReport {
    fn bare(status: IndexStatus) -> Self {
        Self {
            status,
            source: None,
            kb_fingerprint: None,
            embedding_model: None,
            chunk_size: None,
            chunk_overlap: None,
            built_at: None,
            kb_docs: None,
            chunks: None,
            error: None,
        }
    }

    pub fn initializing() -> Self {
        Self::bare(IndexStatus::Initializing)
    }

    pub fn index_error(error: impl Into<String>) -> Self {
        let mut report = Self::bare(IndexStatus::IndexError);
        report.error = Some(error.into());
        report
    }
}

/// Bundled result of [`build_or_load`].
pub struct BuildOutcome {
    pub index: Option<Arc<VectorIndex>>,
    pub retriever: Option<Arc<Retriever>>,
    pub report: IndexReport,
}

/// Retrieves the `k` nearest KB chunks for a query text.
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    k: usize,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<dyn Embedder>, k: usize) -> Self {
        Self { index, embedder, k }
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.embedder.embed_query(query).await?;
        Ok(self.index.search(&query_vec, self.k))
    }
}

/// Render retrieved chunks as a provenance-tagged context block for the
/// generation prompt.
pub fn format_docs(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return "[KB:empty]\n(No relevant knowledge found.)".to_string();
    }

    let formatted: Vec<String> = chunks
        .iter()
        .map(|c| {
            let tag = match c.page {
                Some(page) => format!("[KB:{}:p{}]", c.source, page),
                None => format!("[KB:{}]", c.source),
            };
            format!("{}\n{}", tag, c.text)
        })
        .collect();

    formatted.join("\n\n---\n\n")
}

/// Load the persisted index if fresh, otherwise rebuild from `docs`.
///
/// Returns `Err` only for slow-path failures (embedding backend down,
/// persistence I/O) — the caller surfaces those as `index_error` status.
/// Fast-path failures of any kind fall through to rebuild.
pub async fn build_or_load(
    docs: &[KbDocument],
    glob_pattern: &str,
    index_dir: &Path,
    chunking: &ChunkingConfig,
    embedder: Arc<dyn Embedder>,
    k: usize,
) -> Result<BuildOutcome> {
    let fp = fingerprint(glob_pattern)?;
    let model = embedder.model_name().to_string();

    if let Some(index) = load_if_fresh(index_dir, &fp, &model) {
        info!(chunks = index.len(), "KB index loaded from disk");
        let index = Arc::new(index);
        let mut report = IndexReport::bare(IndexStatus::Loaded);
        report.source = Some("disk".to_string());
        report.kb_fingerprint = Some(fp.as_str().to_string());
        report.embedding_model = Some(model);
        report.chunks = Some(index.len());
        let retriever = Arc::new(Retriever::new(index.clone(), embedder, k));
        return Ok(BuildOutcome {
            index: Some(index),
            retriever: Some(retriever),
            report,
        });
    }

    // Slow path. An assistant with no KB is valid, not an error.
    if docs.is_empty() {
        let mut report = IndexReport::bare(IndexStatus::Empty);
        report.kb_fingerprint = Some(fp.as_str().to_string());
        return Ok(BuildOutcome {
            index: None,
            retriever: None,
            report,
        });
    }

    let drafts = chunk_documents(docs, chunking.chunk_size, chunking.chunk_overlap);
    let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH) {
        vectors.extend(embedder.embed(batch).await?);
    }
    if vectors.len() != drafts.len() {
        bail!(
            "Embedding backend returned {} vectors for {} chunks",
            vectors.len(),
            drafts.len()
        );
    }

    let chunks: Vec<IndexedChunk> = drafts
        .into_iter()
        .zip(vectors)
        .map(|(draft, vector)| IndexedChunk {
            id: Uuid::new_v4().to_string(),
            source: draft.source,
            page: draft.page,
            chunk_index: draft.chunk_index,
            text: draft.text,
            vector,
        })
        .collect();

    let index = VectorIndex { chunks };
    let meta = IndexMeta {
        kb_fingerprint: fp.as_str().to_string(),
        embedding_model: model.clone(),
        chunk_size: chunking.chunk_size,
        chunk_overlap: chunking.chunk_overlap,
        built_at: chrono::Utc::now().timestamp(),
    };
    persist_index(index_dir, &index, &meta)?;
    info!(chunks = index.len(), docs = docs.len(), "KB index rebuilt");

    let index = Arc::new(index);
    let mut report = IndexReport::bare(IndexStatus::Built);
    report.source = Some("rebuild".to_string());
    report.kb_fingerprint = Some(meta.kb_fingerprint);
    report.embedding_model = Some(meta.embedding_model);
    report.chunk_size = Some(meta.chunk_size);
    report.chunk_overlap = Some(meta.chunk_overlap);
    report.built_at = Some(meta.built_at);
    report.kb_docs = Some(docs.len());
    report.chunks = Some(index.len());

    let retriever = Arc::new(Retriever::new(index.clone(), embedder, k));
    Ok(BuildOutcome {
        index: Some(index),
        retriever: Some(retriever),
        report,
    })
}

/// Read the persisted index if its metadata matches the expected
/// fingerprint and model. Every failure mode returns `None`.
fn load_if_fresh(index_dir: &Path, expected_fp: &Fingerprint, model: &str) -> Option<VectorIndex> {
    let meta_text = std::fs::read_to_string(index_dir.join(META_FILE)).ok()?;
    let meta: IndexMeta = serde_json::from_str(&meta_text).ok()?;

    if meta.kb_fingerprint != expected_fp.as_str() {
        debug!("KB fingerprint changed, index is stale");
        return None;
    }
    if meta.embedding_model != model {
        debug!(
            stored = %meta.embedding_model,
            requested = %model,
            "embedding model mismatch, index not reusable"
        );
        return None;
    }

    let body_text = std::fs::read_to_string(index_dir.join(INDEX_FILE)).ok()?;
    let body: IndexBody = serde_json::from_str(&body_text).ok()?;
    if body.chunks.is_empty() {
        return None;
    }

    Some(VectorIndex {
        chunks: body.chunks,
    })
}

/// Stage both files, then rename the stage over `index_dir`.
fn persist_index(index_dir: &Path, index: &VectorIndex, meta: &IndexMeta) -> Result<()> {
    let staging = index_dir.with_extension("staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    // Body before metadata: a stage interrupted mid-write can never hold
    // metadata without its index.
    let body = IndexBody {
        chunks: index.chunks.clone(),
    };
    std::fs::write(staging.join(INDEX_FILE), serde_json::to_string(&body)?)?;
    std::fs::write(
        staging.join(META_FILE),
        serde_json::to_string_pretty(meta)?,
    )?;

    if index_dir.exists() {
        std::fs::remove_dir_all(index_dir)?;
    }
    std::fs::rename(&staging, index_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::digest_entries;

    fn chunk(source: &str, idx: i64, text: &str, vector: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            page: None,
            chunk_index: idx,
            text: text.to_string(),
            vector,
        }
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let index = VectorIndex {
            chunks: vec![
                chunk("a.txt", 0, "far", vec![0.0, 1.0]),
                chunk("a.txt", 1, "near", vec![1.0, 0.0]),
                chunk("b.txt", 0, "middle", vec![0.7, 0.7]),
            ],
        };
        let results = index.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].text, "near");
        assert_eq!(results[1].text, "middle");
        assert_eq!(results[2].text, "far");
    }

    #[test]
    fn test_search_bounded_by_k() {
        let index = VectorIndex {
            chunks: (0..10)
                .map(|i| chunk("a.txt", i, "t", vec![1.0, 0.0]))
                .collect(),
        };
        assert_eq!(index.search(&[1.0, 0.0], 3).len(), 3);
    }

    #[test]
    fn test_search_ties_break_deterministically() {
        let index = VectorIndex {
            chunks: vec![
                chunk("b.txt", 0, "tie-b", vec![1.0, 0.0]),
                chunk("a.txt", 1, "tie-a1", vec![1.0, 0.0]),
                chunk("a.txt", 0, "tie-a0", vec![1.0, 0.0]),
            ],
        };
        let results = index.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].text, "tie-a0");
        assert_eq!(results[1].text, "tie-a1");
        assert_eq!(results[2].text, "tie-b");
    }

    #[test]
    fn test_format_docs_tags() {
        let chunks = vec![
            ScoredChunk {
                source: "guide.pdf".to_string(),
                page: Some(2),
                chunk_index: 0,
                text: "warfarin interacts".to_string(),
                score: 0.9,
            },
            ScoredChunk {
                source: "notes.txt".to_string(),
                page: None,
                chunk_index: 4,
                text: "INR target range".to_string(),
                score: 0.7,
            },
        ];
        let formatted = format_docs(&chunks);
        assert!(formatted.contains("[KB:guide.pdf:p2]"));
        assert!(formatted.contains("[KB:notes.txt]"));
        assert!(formatted.contains("\n\n---\n\n"));
    }

    #[test]
    fn test_format_docs_empty() {
        assert!(format_docs(&[]).starts_with("[KB:empty]"));
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = IndexMeta {
            kb_fingerprint: "abc123".to_string(),
            embedding_model: "all-minilm-l6-v2".to_string(),
            chunk_size: 800,
            chunk_overlap: 120,
            built_at: 1_700_000_000,
        };
        let text = serde_json::to_string(&meta).unwrap();
        let parsed: IndexMeta = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_persist_then_load_if_fresh() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index_dir = tmp.path().join("kb_index");

        let fp = digest_entries(vec![]);
        let index = VectorIndex {
            chunks: vec![chunk("a.txt", 0, "hello", vec![1.0, 0.0])],
        };
        let meta = IndexMeta {
            kb_fingerprint: fp.as_str().to_string(),
            embedding_model: "test-model".to_string(),
            chunk_size: 800,
            chunk_overlap: 120,
            built_at: 1,
        };
        persist_index(&index_dir, &index, &meta).unwrap();

        assert!(index_dir.join(INDEX_FILE).exists());
        assert!(index_dir.join(META_FILE).exists());
        assert!(!index_dir.with_extension("staging").exists());

        let loaded = load_if_fresh(&index_dir, &fp, "test-model").unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_load_rejects_model_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index_dir = tmp.path().join("kb_index");
        let fp = digest_entries(vec![]);

        let index = VectorIndex {
            chunks: vec![chunk("a.txt", 0, "hello", vec![1.0])],
        };
        let meta = IndexMeta {
            kb_fingerprint: fp.as_str().to_string(),
            embedding_model: "model-a".to_string(),
            chunk_size: 800,
            chunk_overlap: 120,
            built_at: 1,
        };
        persist_index(&index_dir, &index, &meta).unwrap();

        assert!(load_if_fresh(&index_dir, &fp, "model-b").is_none());
    }

    #[test]
    fn test_load_rejects_corrupt_meta() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index_dir = tmp.path().join("kb_index");
        std::fs::create_dir_all(&index_dir).unwrap();
        std::fs::write(index_dir.join(META_FILE), "{ not json").unwrap();
        std::fs::write(index_dir.join(INDEX_FILE), "{\"chunks\": []}").unwrap();

        let fp = digest_entries(vec![]);
        assert!(load_if_fresh(&index_dir, &fp, "any").is_none());
    }

    #[test]
    fn test_load_rejects_missing_body() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index_dir = tmp.path().join("kb_index");
        std::fs::create_dir_all(&index_dir).unwrap();
        let fp = digest_entries(vec![]);
        let meta = IndexMeta {
            kb_fingerprint: fp.as_str().to_string(),
            embedding_model: "m".to_string(),
            chunk_size: 800,
            chunk_overlap: 120,
            built_at: 1,
        };
        std::fs::write(
            index_dir.join(META_FILE),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();

        assert!(load_if_fresh(&index_dir, &fp, "m").is_none());
    }

    #[test]
    fn test_persist_overwrites_prior_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index_dir = tmp.path().join("kb_index");
        std::fs::create_dir_all(&index_dir).unwrap();
        std::fs::write(index_dir.join("stale.bin"), "junk").unwrap();

        let index = VectorIndex {
            chunks: vec![chunk("a.txt", 0, "hello", vec![1.0])],
        };
        let meta = IndexMeta {
            kb_fingerprint: "fp".to_string(),
            embedding_model: "m".to_string(),
            chunk_size: 800,
            chunk_overlap: 120,
            built_at: 1,
        };
        persist_index(&index_dir, &index, &meta).unwrap();
        assert!(!index_dir.join("stale.bin").exists());
        assert!(index_dir.join(INDEX_FILE).exists());
    }
}
