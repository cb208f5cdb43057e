use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub mapping: MappingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the model gateway, e.g. `https://gateway.example.com`.
    pub base_url: String,
    /// Model identifier appended to the endpoint path.
    pub model: String,
    /// Knowledge-source handle passed with every grounded request.
    pub knowledge_source: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Timeout for single-shot calls (title generation). The streaming
    /// call is unbounded by design.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Question/answer prefix length used when building the title prompt.
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

fn default_api_key_env() -> String {
    "ATLAS_UPSTREAM_API_KEY".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_title_max_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct MappingConfig {
    /// Object-store URL of the file-mapping JSON document.
    pub url: String,
    /// Cache TTL in seconds.
    #[serde(default = "default_mapping_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_mapping_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mapping_ttl_secs() -> u64 {
    300
}
fn default_mapping_timeout_secs() -> u64 {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.upstream.base_url.is_empty() {
        anyhow::bail!("upstream.base_url must not be empty");
    }
    if config.upstream.model.is_empty() {
        anyhow::bail!("upstream.model must not be empty");
    }
    if config.upstream.knowledge_source.is_empty() {
        anyhow::bail!("upstream.knowledge_source must not be empty");
    }
    if config.upstream.title_max_chars == 0 {
        anyhow::bail!("upstream.title_max_chars must be > 0");
    }
    if config.mapping.url.is_empty() {
        anyhow::bail!("mapping.url must not be empty");
    }
    if config.mapping.ttl_secs == 0 {
        anyhow::bail!("mapping.ttl_secs must be > 0");
    }

    Ok(config)
}
