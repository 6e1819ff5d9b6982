use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::validator::ValidatorMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub kb: KbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KbConfig {
    /// Glob pattern selecting the KB corpus files, e.g. `"sample_kb/*"`.
    pub glob: String,
    /// Directory holding the persisted index body and `meta.json`.
    pub index_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Serve a deterministic mock answer when the generation backend fails.
    #[serde(default = "default_true")]
    pub allow_mock_fallback: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_generation_url(),
            model: default_generation_model(),
            timeout_secs: default_generation_timeout_secs(),
            allow_mock_fallback: true,
        }
    }
}

fn default_generation_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_generation_model() -> String {
    "llama3.2".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidatorMode,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_validation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub allow_offline_fallback: bool,
    #[serde(default = "default_validator_model")]
    pub model: String,
    #[serde(default = "default_validation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidatorMode::default(),
            confidence_threshold: default_confidence_threshold(),
            max_retries: default_validation_retries(),
            allow_offline_fallback: true,
            model: default_validator_model(),
            timeout_secs: default_validation_timeout_secs(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_validation_retries() -> u32 {
    2
}
fn default_validator_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}
fn default_validation_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate validation thresholds (confidence is 0.0-1.0 end-to-end)
    if !(0.0..=1.0).contains(&config.validation.confidence_threshold) {
        anyhow::bail!("validation.confidence_threshold must be in [0.0, 1.0]");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config(
            r#"
[kb]
glob = "sample_kb/*"
index_dir = "kb_index"

[chunking]

[server]
bind = "127.0.0.1:8000"
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 120);
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(config.validation.allow_offline_fallback);
        assert!((config.validation.confidence_threshold - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let f = write_config(
            r#"
[kb]
glob = "kb/*"
index_dir = "kb_index"

[chunking]
chunk_size = 100
chunk_overlap = 100

[server]
bind = "127.0.0.1:8000"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let f = write_config(
            r#"
[kb]
glob = "kb/*"
index_dir = "kb_index"

[chunking]

[embedding]
provider = "faiss"
model = "all-minilm-l6-v2"

[server]
bind = "127.0.0.1:8000"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let f = write_config(
            r#"
[kb]
glob = "kb/*"
index_dir = "kb_index"

[chunking]

[validation]
confidence_threshold = 1.5

[server]
bind = "127.0.0.1:8000"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }
}
