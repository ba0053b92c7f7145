//! Store configuration.
//!
//! [`StoreSettings`] is the resolved runtime configuration (all defaults
//! filled). A small `mnemo.toml` in the store directory persists the
//! values that must survive across opens; everything else can be set per
//! process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_FILENAME: &str = "mnemo.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    Ollama,
    OpenRouter,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenRouter => "openrouter",
        }
    }
}

/// Identity of the embedding backend a store was indexed with.
///
/// The identity is global per store: when it changes, every stored
/// vector is stale and the store enters a reindex transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingIdentity {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

impl EmbeddingIdentity {
    /// Stable string form, used for cache keys and the store meta table.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.provider, self.model, self.dimension)
    }
}

impl std::fmt::Display for EmbeddingIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({}d)", self.provider, self.model, self.dimension)
    }
}

/// Resolved store settings (all values filled with defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Store directory; the database and config file live here.
    pub store_path: PathBuf,
    #[serde(default)]
    pub db_path_override: Option<PathBuf>,

    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: EmbeddingProviderKind,
    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_dim: Option<usize>,
    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: usize,

    #[serde(default = "default_summarize_url")]
    pub summarize_url: String,
    #[serde(default = "default_summarize_model")]
    pub summarize_model: String,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_max_summary_length")]
    pub max_summary_length: usize,
    /// Recency decay half-life in days; 0 disables decay.
    #[serde(default = "default_decay_half_life_days")]
    pub decay_half_life_days: f64,

    /// Tags applied to every write, below env and caller tags.
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
    /// Tag keys every non-system write must carry.
    #[serde(default)]
    pub required_tags: Vec<String>,

    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
}

impl StoreSettings {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            db_path_override: None,
            embedding_provider: default_embedding_provider(),
            embedding_url: default_embedding_url(),
            embedding_model: default_embedding_model(),
            embedding_dim: None,
            embedding_cache_size: default_embedding_cache_size(),
            summarize_url: default_summarize_url(),
            summarize_model: default_summarize_model(),
            provider_timeout_secs: default_provider_timeout_secs(),
            max_summary_length: default_max_summary_length(),
            decay_half_life_days: default_decay_half_life_days(),
            default_tags: BTreeMap::new(),
            required_tags: Vec::new(),
            claim_timeout_secs: default_claim_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path_override
            .clone()
            .unwrap_or_else(|| self.store_path.join("mnemo.sqlite3"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.store_path.join(CONFIG_FILENAME)
    }
}

/// Persisted slice of the configuration (`mnemo.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfigFile {
    #[serde(default)]
    pub store: StoreConfigSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfigSection {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub system_docs_version: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("toml serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub fn load_config_file(path: &Path) -> Result<Option<StoreConfigFile>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(toml::from_str(&text)?))
}

pub fn save_config_file(path: &Path, config: &StoreConfigFile) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Ollama
}

fn default_embedding_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_cache_size() -> usize {
    2048
}

fn default_summarize_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_summarize_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_max_summary_length() -> usize {
    500
}

fn default_decay_half_life_days() -> f64 {
    30.0
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_base_secs() -> u64 {
    30
}

fn default_retry_backoff_max_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_stable() {
        let id = EmbeddingIdentity {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            dimension: 768,
        };
        assert_eq!(id.key(), "ollama/nomic-embed-text/768");
    }

    #[test]
    fn settings_defaults() {
        let s = StoreSettings::new("/tmp/store");
        assert_eq!(s.max_summary_length, 500);
        assert_eq!(s.decay_half_life_days, 30.0);
        assert_eq!(s.max_attempts, 5);
        assert!(s.db_path().ends_with("mnemo.sqlite3"));
    }
}
