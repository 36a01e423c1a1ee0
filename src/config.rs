//! Configuration parsing and validation.
//!
//! Knowbridge is configured with a single TOML file. Every section except
//! `[db]` has usable defaults, so a minimal config is:
//!
//! ```toml
//! [db]
//! path = "./data/knowbridge.sqlite"
//! ```
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[db]` | SQLite database location |
//! | `[chunking]` | Paragraph chunker size |
//! | `[retrieval]` | Hybrid weights, candidate counts, context budget, search deadline |
//! | `[embedding]` | Embedding provider, model, dimensions, retry policy |
//! | `[completion]` | Completion provider, model, temperature, retry policy |
//! | `[indexing]` | Batch sizing and worker parallelism |
//! | `[conversation]` | History window, cache, advisory locking, empty-context policy |
//! | `[prompts]` | Default template and custom templates |
//! | `[documents]` | Filesystem document source |
//! | `[server]` | HTTP bind address |
//!
//! API keys are never read from the file; providers take them from the
//! environment (`OPENAI_API_KEY`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub documents: Option<DocumentsConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Search backend: `sqlite` or `memory`.
    #[serde(default = "default_search_backend")]
    pub backend: String,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: usize,
    /// Results requested from hybrid search before relevance filtering.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum raw cosine similarity when vector search ran.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_min_fragment_tokens")]
    pub min_fragment_tokens: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_search_backend(),
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            max_chunks: default_max_chunks(),
            token_budget: default_token_budget(),
            min_fragment_tokens: default_min_fragment_tokens(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_search_backend() -> String {
    "sqlite".to_string()
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    50
}
fn default_top_k() -> usize {
    20
}
fn default_min_relevance() -> f64 {
    0.2
}
fn default_max_chunks() -> usize {
    6
}
fn default_token_budget() -> usize {
    1500
}
fn default_min_fragment_tokens() -> usize {
    20
}
fn default_search_timeout_secs() -> u64 {
    10
}

/// Backoff settings shared by the embedding and completion sections.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            ..RetryPolicy::default()
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    16_000
}
fn default_jitter() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, `ollama`, or `hash`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            timeout_secs: default_completion_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_completion_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Upper bound on bytes of text sent in one embedding request.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Fallback average chunk size when a document has no chunks to sample.
    #[serde(default = "default_avg_chunk_chars")]
    pub avg_chunk_chars: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-request upsert limit enforced by the search backend (0 = none).
    #[serde(default)]
    pub backend_batch_limit: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            avg_chunk_chars: default_avg_chunk_chars(),
            max_batch_size: default_max_batch_size(),
            workers: default_workers(),
            backend_batch_limit: 0,
        }
    }
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}
fn default_avg_chunk_chars() -> usize {
    1600
}
fn default_max_batch_size() -> usize {
    64
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Most recent messages rendered into the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Messages kept per cached conversation.
    #[serde(default = "default_cache_window")]
    pub cache_window: usize,
    /// Hold a per-conversation lock for the whole turn.
    #[serde(default)]
    pub serialize_turns: bool,
    /// `general` or `decline`.
    #[serde(default = "default_on_empty_context")]
    pub on_empty_context: String,
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            history_token_budget: default_history_token_budget(),
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_window: default_cache_window(),
            serialize_turns: false,
            on_empty_context: default_on_empty_context(),
            default_user_id: default_user_id(),
        }
    }
}

fn default_history_turns() -> usize {
    10
}
fn default_history_token_budget() -> usize {
    1000
}
fn default_cache_enabled() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_window() -> usize {
    50
}
fn default_on_empty_context() -> String {
    "general".to_string()
}
fn default_user_id() -> String {
    "anonymous".to_string()
}

/// A prompt template as written in config.
#[derive(Debug, Deserialize, Clone)]
pub struct TemplateConfig {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "default_template")]
    pub default_template: String,
    /// Additional or overriding templates, keyed by type name.
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateConfig>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            default_template: default_template(),
            templates: BTreeMap::new(),
        }
    }
}

fn default_template() -> String {
    "knowledge".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    let r = &config.retrieval;
    if !(0.0..=1.0).contains(&r.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if r.top_k == 0 || r.max_chunks == 0 {
        bail!("retrieval.top_k and retrieval.max_chunks must be >= 1");
    }
    if r.candidate_k_keyword == 0 || r.candidate_k_vector == 0 {
        bail!("retrieval.candidate_k_keyword and candidate_k_vector must be >= 1");
    }
    if !(-1.0..=1.0).contains(&r.min_relevance) {
        bail!("retrieval.min_relevance must be in [-1.0, 1.0]");
    }
    match r.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown retrieval backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hash" {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    match config.completion.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.completion.model.is_none() {
                bail!(
                    "completion.model must be specified when provider is '{}'",
                    config.completion.provider
                );
            }
        }
        other => bail!(
            "Unknown completion provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    for (name, retry) in [
        ("embedding", &config.embedding.retry),
        ("completion", &config.completion.retry),
    ] {
        if retry.max_attempts == 0 {
            bail!("{}.retry.max_attempts must be >= 1", name);
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            bail!("{}.retry.base_delay_ms must be <= max_delay_ms", name);
        }
    }

    if config.indexing.max_batch_size == 0 || config.indexing.workers == 0 {
        bail!("indexing.max_batch_size and indexing.workers must be >= 1");
    }

    match config.conversation.on_empty_context.as_str() {
        "general" | "decline" => {}
        other => bail!(
            "conversation.on_empty_context must be 'general' or 'decline', got '{}'",
            other
        ),
    }

    Ok(())
}
