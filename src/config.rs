//! TOML configuration for the vault, its backends, and the HTTP server.
//!
//! Every section except `[vault]` is optional and falls back to the defaults
//! documented on each field. [`load_config`] parses and validates a file;
//! [`Config::for_vault`] builds an all-defaults config for a vault root.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub agentic: AgenticConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    /// Where connector state, logs, and the SQLite vector file live.
    /// Defaults to `<root>/.brainvault`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl VaultConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".brainvault"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
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
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Deterministic offline embeddings, mostly for tests and demos.
    pub fn hashed(dims: usize) -> Self {
        Self {
            provider: "hash".to_string(),
            model: Some("token-hash".to_string()),
            dims: Some(dims),
            ..Self::default()
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
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// `memory`, `sqlite`, or `chroma`.
    #[serde(default = "default_store_provider")]
    pub provider: String,
    /// SQLite file. Defaults to `<state_dir>/vectors.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Chroma server URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
            path: None,
            collection: default_collection(),
            url: None,
            tenant: default_tenant(),
            database: default_database(),
            timeout_secs: default_store_timeout(),
        }
    }
}

fn default_store_provider() -> String {
    "sqlite".to_string()
}
fn default_collection() -> String {
    "markdown_notes".to_string()
}
fn default_tenant() -> String {
    "default_tenant".to_string()
}
fn default_database() -> String {
    "default_database".to_string()
}
fn default_store_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_similarity: f64,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    /// Diversity cap: results kept per file path.
    #[serde(default = "default_max_per_file")]
    pub max_per_file: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: 0.0,
            similarity_weight: default_similarity_weight(),
            recency_weight: default_recency_weight(),
            quality_weight: default_quality_weight(),
            max_per_file: default_max_per_file(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_similarity_weight() -> f64 {
    0.7
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_quality_weight() -> f64 {
    0.1
}
fn default_max_per_file() -> usize {
    3
}
fn default_snippet_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            base_url: default_llm_base_url(),
        }
    }
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_llm_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}
fn default_llm_max_tokens() -> u32 {
    4000
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    2
}
fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_ingest_retries(),
            chunk_max_tokens: default_chunk_max_tokens(),
        }
    }
}

fn default_ingest_retries() -> u32 {
    3
}
fn default_chunk_max_tokens() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgenticConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_grep_timeout")]
    pub grep_timeout_secs: u64,
    #[serde(default = "default_grep_limit")]
    pub grep_limit: usize,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            grep_timeout_secs: default_grep_timeout(),
            grep_limit: default_grep_limit(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}
fn default_grep_timeout() -> u64 {
    5
}
fn default_grep_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Mount the MCP Streamable HTTP endpoint at `/mcp`.
    #[serde(default = "default_mcp")]
    pub mcp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            mcp: default_mcp(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}
fn default_mcp() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    /// Named drop-folder instances: `[connectors.notes.<name>]`.
    #[serde(default)]
    pub notes: BTreeMap<String, NotesConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotesConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_notes_platform")]
    pub platform: String,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_notes_platform() -> String {
    "Manual".to_string()
}

impl Config {
    /// All-defaults configuration rooted at `root`.
    pub fn for_vault(root: impl Into<PathBuf>) -> Self {
        Self {
            vault: VaultConfig {
                root: root.into(),
                state_dir: None,
            },
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            ingest: IngestConfig::default(),
            agentic: AgenticConfig::default(),
            server: ServerConfig::default(),
            connectors: ConnectorsConfig::default(),
        }
    }

    pub fn vector_db_path(&self) -> PathBuf {
        self.vector_store
            .path
            .clone()
            .unwrap_or_else(|| self.vault.state_dir().join("vectors.sqlite"))
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.top_k < 1 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if r.max_per_file < 1 {
            anyhow::bail!("retrieval.max_per_file must be >= 1");
        }
        for (name, w) in [
            ("similarity_weight", r.similarity_weight),
            ("recency_weight", r.recency_weight),
            ("quality_weight", r.quality_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "local" => {}
            "openai" | "ollama" | "hash" => {
                if self.embedding.dims.unwrap_or(0) == 0 {
                    anyhow::bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.provider != "hash" && self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
                other
            ),
        }

        match self.vector_store.provider.as_str() {
            "memory" | "sqlite" => {}
            "chroma" => {
                if self.vector_store.url.is_none() {
                    anyhow::bail!("vector_store.url is required when provider is 'chroma'");
                }
            }
            other => anyhow::bail!(
                "Unknown vector store provider: '{}'. Must be memory, sqlite, or chroma.",
                other
            ),
        }

        if self.llm.provider != "anthropic" {
            anyhow::bail!(
                "Unknown llm provider: '{}'. Only 'anthropic' is supported.",
                self.llm.provider
            );
        }
        if self.agentic.max_iterations < 1 {
            anyhow::bail!("agentic.max_iterations must be >= 1");
        }
        if self.ingest.chunk_max_tokens == 0 {
            anyhow::bail!("ingest.chunk_max_tokens must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
