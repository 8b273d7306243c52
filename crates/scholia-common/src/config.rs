//! Configuration loading for Scholia.
//! Reads scholia.toml from the current directory or the path in SCHOLIA_CONFIG.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 3001 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
}

fn default_db_url() -> String { "sqlite://scholia.db".to_string() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_db_url() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Wall-clock budget per source during fan-out, seconds.
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pubmed: PubMedConfig,
    #[serde(default)]
    pub arxiv: ArxivConfig,
}

fn default_source_timeout() -> u64 { 10 }
fn default_limit() -> u32 { 20 }
fn default_max_limit() -> u32 { 100 }

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            source_timeout_secs: default_source_timeout(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            retry: RetryConfig::default(),
            pubmed: PubMedConfig::default(),
            arxiv: ArxivConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PubMedConfig {
    /// Optional NCBI API key for higher rate limits.
    pub api_key: Option<String>,
    /// NCBI allows 3 req/s without a key.
    #[serde(default = "default_pubmed_interval")]
    pub min_request_interval_ms: u64,
}

fn default_pubmed_interval() -> u64 { 334 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArxivConfig {
    /// arXiv asks for no more than one request every 3 seconds.
    #[serde(default = "default_arxiv_interval")]
    pub min_request_interval_ms: u64,
}

fn default_arxiv_interval() -> u64 { 3000 }

impl Default for ArxivConfig {
    fn default() -> Self {
        Self { min_request_interval_ms: default_arxiv_interval() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Global cap on concurrently running harvests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How often the scheduler checks for due sources, seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent() -> usize { 2 }
fn default_tick_interval() -> u64 { 60 }

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            tick_interval_secs: default_tick_interval(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 32_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl AppConfig {
    /// Load from SCHOLIA_CONFIG, ./scholia.toml, or defaults, in that order.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("SCHOLIA_CONFIG") {
            return Self::from_file(&path);
        }
        if Path::new("scholia.toml").exists() {
            return Self::from_file("scholia.toml");
        }
        Ok(Self::default())
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}
