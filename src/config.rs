use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Upper bound on files expanded from one drive folder.
    #[serde(default = "default_max_folder_files")]
    pub max_folder_files: usize,
    /// Extractions yielding fewer trimmed characters fail the document.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    /// Base URL of the cloud-drive listing/download API.
    #[serde(default)]
    pub drive_base_url: Option<String>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
            max_folder_files: default_max_folder_files(),
            min_text_chars: default_min_text_chars(),
            drive_base_url: None,
        }
    }
}

impl IngestionConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn default_max_file_size_mb() -> u64 {
    50
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("finsight/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_folder_files() -> usize {
    100
}
fn default_min_text_chars() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target passage length in characters.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// Fixed overlap carried between consecutive passages.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_max_chunks_per_document")]
    pub max_chunks_per_document: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            max_chunks_per_document: default_max_chunks_per_document(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_max_chunks_per_document() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Server-side ceiling on top_k regardless of what a client asks for.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// Chunks scoring below this are excluded from model context.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            min_similarity: default_min_similarity(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    20
}
fn default_min_similarity() -> f64 {
    0.25
}
fn default_max_context_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local`, `openai`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
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
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_dims() -> usize {
    384
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
pub struct LlmConfig {
    /// `echo`, `openai`, or `disabled`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    /// Base URL of an OpenAI-compatible chat completions API
    /// (e.g. `http://localhost:11434/v1` for Ollama).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    /// How many prior messages are replayed as history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: None,
            model: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_llm_provider() -> String {
    "echo".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_max_retries() -> u32 {
    2
}
fn default_history_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountingConfig {
    #[serde(default = "default_accounting_host")]
    pub host: String,
    #[serde(default = "default_accounting_port")]
    pub port: u16,
    #[serde(default = "default_accounting_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds before an `error` connection decays to `disconnected`.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Liveness poll cadence; 0 disables background polling.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            host: default_accounting_host(),
            port: default_accounting_port(),
            timeout_secs: default_accounting_timeout_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl AccountingConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn default_accounting_host() -> String {
    "localhost".to_string()
}
fn default_accounting_port() -> u16 {
    9000
}
fn default_accounting_timeout_secs() -> u64 {
    30
}
fn default_error_backoff_secs() -> u64 {
    15
}
fn default_poll_interval_secs() -> u64 {
    0
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
    "127.0.0.1:8600".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }
    if config.retrieval.top_k == 0 || config.retrieval.max_top_k == 0 {
        anyhow::bail!("retrieval.top_k and retrieval.max_top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'openai'");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "echo" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or echo.",
            other
        ),
    }
    if config.llm.provider == "openai" && config.llm.model.is_none() {
        anyhow::bail!("llm.model must be specified when provider is 'openai'");
    }

    Ok(())
}

impl Config {
    /// Config with defaults everywhere except the database path. Used by
    /// tests and embedding callers that construct state programmatically.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            ingestion: IngestionConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            accounting: AccountingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::with_db_path(PathBuf::from("/tmp/x.sqlite"));
        assert!(validate(&config).is_ok());
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.llm.provider, "echo");
    }

    #[test]
    fn rejects_overlap_ge_chunk() {
        let mut config = Config::with_db_path(PathBuf::from("/tmp/x.sqlite"));
        config.chunking.overlap_chars = config.chunking.chunk_chars;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config = Config::with_db_path(PathBuf::from("/tmp/x.sqlite"));
        config.embedding.provider = "quantum".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let parsed: Config = toml::from_str("[db]\npath = \"data/fin.sqlite\"\n").unwrap();
        assert!(validate(&parsed).is_ok());
        assert_eq!(parsed.retrieval.top_k, 5);
        assert_eq!(parsed.accounting.endpoint(), "http://localhost:9000");
    }
}
