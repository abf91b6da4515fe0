use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ContinuumConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub curation: CurationConfig,
    pub context: ContextConfig,
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for `state.db` and the per-stream logs under `streams/`.
    pub data_dir: String,
    /// The replicated graph store.
    pub graph_db_path: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub queue_threshold: usize,
    pub batch_size: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CurationConfig {
    pub top_k: usize,
    pub quality_threshold: f64,
    pub neighborhood_floor: f64,
    pub near_duplicate: f64,
    pub highly_related: f64,
    pub scan_limit: usize,
    pub conflict_retries: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub event_limit: usize,
    pub max_event_limit: usize,
    pub depth: usize,
    /// Token budget for a bundle (estimated at four characters per token).
    pub size_budget: usize,
    pub timeout_ms: u64,
    pub max_neighbors_per_hop: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimilarityConfig {
    /// `"lexical"` or `"remote"`.
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key for `remote`.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 7341,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_continuum_dir();
        let graph_db_path = data_dir.join("graph.db").to_string_lossy().into_owned();
        Self {
            data_dir: data_dir.to_string_lossy().into_owned(),
            graph_db_path,
            pool_size: 8,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            queue_threshold: 5,
            batch_size: 50,
            base_backoff_ms: 1000,
            max_backoff_secs: 300,
            channel_capacity: 256,
        }
    }
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            quality_threshold: 0.75,
            neighborhood_floor: 0.80,
            near_duplicate: 0.95,
            highly_related: 0.85,
            scan_limit: 500,
            conflict_retries: 3,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            event_limit: 50,
            max_event_limit: 500,
            depth: 2,
            size_budget: 8000,
            timeout_ms: 2000,
            max_neighbors_per_hop: 25,
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            provider: "lexical".into(),
            endpoint: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            api_key_env: "CONTINUUM_EMBEDDING_API_KEY".into(),
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Delay before the next attempt after `attempts` consecutive failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_secs.saturating_mul(1000)))
    }
}

impl ContextConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Returns `~/.continuum/`
pub fn default_continuum_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".continuum")
}

/// Returns the default config file path: `~/.continuum/config.toml`
pub fn default_config_path() -> PathBuf {
    default_continuum_dir().join("config.toml")
}

impl ContinuumConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            ContinuumConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (CONTINUUM_DATA_DIR, CONTINUUM_GRAPH_DB, CONTINUUM_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CONTINUUM_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("CONTINUUM_GRAPH_DB") {
            self.storage.graph_db_path = val;
        }
        if let Ok(val) = std::env::var("CONTINUUM_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn resolved_state_db_path(&self) -> PathBuf {
        self.resolved_data_dir().join("state.db")
    }

    pub fn resolved_streams_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("streams")
    }

    pub fn resolved_graph_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.graph_db_path)
    }

    /// Config rooted at `dir`, for tests and embedded use.
    pub fn rooted_at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut config = ContinuumConfig::default();
        config.storage.data_dir = dir.to_string_lossy().into_owned();
        config.storage.graph_db_path = dir.join("graph.db").to_string_lossy().into_owned();
        config
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
