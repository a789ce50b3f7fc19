use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub layout: Option<LayoutConfig>,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Origins allowed to call the API from a browser. Empty means none.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

/// Blob container holding chunk objects.
///
/// Credentials come from `AZURE_STORAGE_CONNECTION_STRING`, or from
/// `account` plus `AZURE_STORAGE_ACCOUNT_KEY`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub account: Option<String>,
    pub container: String,
    /// Override for the blob endpoint (Azurite, sovereign clouds).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub index: String,
    pub indexer: String,
    #[serde(default = "default_search_api_version")]
    pub api_version: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_content_field")]
    pub content_field: String,
}

fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_content_field() -> String {
    "content".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LayoutConfig {
    pub endpoint: String,
    #[serde(default = "default_layout_model")]
    pub model: String,
    #[serde(default = "default_layout_api_version")]
    pub api_version: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_layout_model() -> String {
    "prebuilt-layout".to_string()
}
fn default_layout_api_version() -> String {
    "2023-07-31".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_polls() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub deployment: String,
    #[serde(default = "default_completion_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_completion_api_version() -> String {
    "2024-12-01-preview".to_string()
}
fn default_max_tokens() -> u32 {
    800
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.95
}
fn default_max_context_chars() -> usize {
    48_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    4000
}

/// How a requested document name selects objects for deletion.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMatch {
    /// Base document name must equal the requested name.
    #[default]
    Exact,
    /// Object name (after the classification) starts with the requested name.
    Prefix,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DocumentsConfig {
    #[serde(default)]
    pub delete_match: DeleteMatch,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }

    if config.search.top_k < 1 {
        anyhow::bail!("search.top_k must be >= 1");
    }

    if !(0.0..=2.0).contains(&config.completion.temperature) {
        anyhow::bail!("completion.temperature must be in [0.0, 2.0]");
    }

    if !(config.completion.top_p > 0.0 && config.completion.top_p <= 1.0) {
        anyhow::bail!("completion.top_p must be in (0.0, 1.0]");
    }

    if config.completion.max_context_chars == 0 {
        anyhow::bail!("completion.max_context_chars must be > 0");
    }

    if config.storage.signed_url_ttl_secs == 0 {
        anyhow::bail!("storage.signed_url_ttl_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[storage]
container = "data"

[search]
endpoint = "https://search.example.net"
index = "blob-index"
indexer = "blob-indexer"

[completion]
endpoint = "https://llm.example.net"
deployment = "gpt-4o"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.server.allowed_origins.is_empty());
        assert_eq!(config.chunking.chunk_size, 4000);
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.search.content_field, "content");
        assert_eq!(config.completion.max_tokens, 800);
        assert!((config.completion.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.completion.max_retries, 0);
        assert_eq!(config.storage.signed_url_ttl_secs, 3600);
        assert_eq!(config.documents.delete_match, DeleteMatch::Exact);
        assert!(config.layout.is_none());
    }

    #[test]
    fn layout_section_and_prefix_matching() {
        let text = format!(
            "{}\n[layout]\nendpoint = \"https://layout.example.net\"\n\n[documents]\ndelete_match = \"prefix\"\n",
            MINIMAL
        );
        let config = parse_config(&text).unwrap();
        let layout = config.layout.unwrap();
        assert_eq!(layout.model, "prebuilt-layout");
        assert_eq!(layout.api_version, "2023-07-31");
        assert_eq!(config.documents.delete_match, DeleteMatch::Prefix);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let text = format!("{}\n[chunking]\nchunk_size = 0\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn unknown_delete_match_rejected() {
        let text = format!("{}\n[documents]\ndelete_match = \"fuzzy\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn out_of_range_top_p_rejected() {
        let text = MINIMAL.replace(
            "deployment = \"gpt-4o\"",
            "deployment = \"gpt-4o\"\ntop_p = 1.5",
        );
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("top_p"));
    }
}
