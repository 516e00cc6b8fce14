use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MnemaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub gate: GateConfig,
    pub cluster: ClusterConfig,
    pub search: SearchTuning,
    pub rerank: RerankConfig,
    pub fanout: FanoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    /// Per-view embed+upsert deadline in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GateConfig {
    /// Events scoring below this significance are discarded before any
    /// embedding or storage work happens.
    pub significance_floor: u8,
}

/// Cluster-assignment scoring knobs. The four weights should sum to ~1.0;
/// they are deliberately configuration rather than constants.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub join_threshold: f64,
    pub embedding_weight: f64,
    pub entity_weight: f64,
    pub actor_weight: f64,
    pub temporal_weight: f64,
    /// Half-life for the temporal-proximity decay, in hours.
    pub half_life_hours: f64,
    /// How many candidate clusters to fetch from the vector store.
    pub candidate_limit: usize,
    /// Clusters idle longer than this are closed by the fanout worker.
    pub close_after_days: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchTuning {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Candidates fetched per search path before merge.
    pub candidate_limit: usize,
    /// Per-path deadline in milliseconds.
    pub path_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    /// Minimum result count guaranteed by the threshold-bypass fallback.
    pub min_results: usize,
    pub balanced_threshold: f64,
    pub thorough_threshold: f64,
    /// Optional HTTP cross-encoder endpoint. Empty means thorough mode
    /// falls back to local lexical scoring.
    pub endpoint: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConfig {
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Clusters need at least this many observations before a summary is written.
    pub summary_min_observations: u64,
    /// Regenerate a cluster summary once it is older than this many hours.
    pub summary_staleness_hours: i64,
}

impl Default for MnemaConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            gate: GateConfig::default(),
            cluster: ClusterConfig::default(),
            search: SearchTuning::default(),
            rerank: RerankConfig::default(),
            fanout: FanoutConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7171,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_mnema_dir()
            .join("mnema.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_mnema_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            timeout_ms: 10_000,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            significance_floor: 40,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            join_threshold: 0.55,
            embedding_weight: 0.50,
            entity_weight: 0.20,
            actor_weight: 0.15,
            temporal_weight: 0.15,
            half_life_hours: 72.0,
            candidate_limit: 8,
            close_after_days: 14,
        }
    }
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            candidate_limit: 40,
            path_timeout_ms: 2_000,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            min_results: 3,
            balanced_threshold: 0.35,
            thorough_threshold: 0.50,
            endpoint: String::new(),
            timeout_ms: 4_000,
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            retry_attempts: 2,
            retry_delay_ms: 250,
            summary_min_observations: 3,
            summary_staleness_hours: 24,
        }
    }
}

/// Returns `~/.mnema/`
pub fn default_mnema_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnema")
}

/// Returns the default config file path: `~/.mnema/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnema_dir().join("config.toml")
}

impl MnemaConfig {
    /// Load config from the default TOML file (if it exists), then apply
    /// env var overrides.
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
            MnemaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MNEMA_DB, MNEMA_PORT, MNEMA_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMA_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("MNEMA_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MnemaConfig::default();
        assert_eq!(config.server.port, 7171);
        assert_eq!(config.gate.significance_floor, 40);
        assert_eq!(config.cluster.candidate_limit, 8);
        assert_eq!(config.rerank.min_results, 3);
        assert!(config.storage.db_path.ends_with("mnema.db"));
        let sum = config.cluster.embedding_weight
            + config.cluster.entity_weight
            + config.cluster.actor_weight
            + config.cluster.temporal_weight;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
port = 9999

[storage]
db_path = "/tmp/test.db"

[gate]
significance_floor = 55

[cluster]
join_threshold = 0.7
"#;
        let config: MnemaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.gate.significance_floor, 55);
        assert!((config.cluster.join_threshold - 0.7).abs() < 1e-9);
        // defaults still apply for unset fields
        assert_eq!(config.search.default_limit, 10);
        assert!((config.cluster.embedding_weight - 0.50).abs() < 1e-9);
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde("~/foo/bar.db");
        assert!(!expanded.to_string_lossy().contains('~'));
        assert!(expanded.to_string_lossy().ends_with("foo/bar.db"));

        let absolute = expand_tilde("/tmp/plain.db");
        assert_eq!(absolute, PathBuf::from("/tmp/plain.db"));
    }
}
