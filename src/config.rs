use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration, loaded from `<state_dir>/config.toml`.
///
/// Every tunable has the documented default; only `vault.path` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vault: VaultConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub ingest: IngestConfig,
    pub monitor: MonitorConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    /// Directory holding `digests.db` and `config.toml`. Resolved to the
    /// platform data dir when unset.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root directory to watch. Required.
    pub path: PathBuf,
    /// File suffixes to ingest.
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Hard chunk size cap in tokens.
    pub max_tokens: usize,
    /// Target chunk size in tokens; clamped to the adaptive range at use.
    pub target_tokens: usize,
    /// Boundary overlap in tokens.
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding dimension, asserted against the provider at construction.
    pub dim: usize,
    /// A batch closes once its aggregate token count reaches this.
    pub batch_tokens: usize,
    /// ...or once it holds this many items, whichever comes first.
    pub batch_items: usize,
    /// Concurrent batches in flight against the provider.
    pub max_inflight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Parallel rewrites across distinct paths.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Per-path coalescing window.
    pub debounce_ms: u64,
    /// Pending-event queue bound; saturation escalates to a full sync.
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight work before aborting.
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates fetched from the store when re-ranking is enabled.
    pub rerank_fanout: usize,
    /// Per-query deadline.
    pub timeout_ms: u64,
    /// Cross-encoder share of the combined score (vector gets the rest).
    pub rerank_weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub qembed_ttl_s: u64,
    pub qembed_capacity: usize,
    pub result_ttl_s: u64,
    pub result_capacity: usize,
}

/// Collection-level tunables handed to the vector store at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub hnsw_construction_ef: usize,
    pub hnsw_search_ef: usize,
    pub hnsw_m: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            extensions: vec![".md".to_string()],
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            target_tokens: 340,
            overlap_tokens: 64,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dim: 384,
            batch_tokens: 8192,
            batch_items: 200,
            max_inflight: 4,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            queue_capacity: 1024,
            shutdown_grace_ms: 5000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rerank_fanout: 20,
            timeout_ms: 2000,
            rerank_weight: 0.7,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            qembed_ttl_s: 86_400,
            qembed_capacity: 10_000,
            result_ttl_s: 1800,
            result_capacity: 2000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hnsw_construction_ef: 200,
            hnsw_search_ef: 100,
            hnsw_m: 16,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingest: IngestConfig::default(),
            monitor: MonitorConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var("LOREVAULT_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("lorevault"))
                .unwrap_or_else(|| PathBuf::from(".lorevault"))
        })
}

impl EngineConfig {
    /// Defaults for the given vault root.
    pub fn for_vault(vault_path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.vault.path = vault_path.into();
        config
    }

    /// Load from `<state_dir>/config.toml`, falling back to defaults when
    /// the file does not exist yet.
    pub fn load(state_dir: &Path) -> EngineResult<Self> {
        let path = state_dir.join("config.toml");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str::<Self>(&raw)
                .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.state_dir = state_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Persist the current configuration with write-temp + rename.
    pub fn save(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let target = self.state_dir.join("config.toml");
        let raw = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("serialize config: {}", e)))?;
        let tmp = target.with_extension("toml.tmp");
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.vault.path.as_os_str().is_empty() {
            return Err(EngineError::Config("vault.path is required".into()));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(EngineError::Config(
                "chunking.overlap_tokens must be smaller than chunking.max_tokens".into(),
            ));
        }
        if self.embedding.dim == 0 {
            return Err(EngineError::Config("embedding.dim must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.search.rerank_weight) {
            return Err(EngineError::Config(
                "search.rerank_weight must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::for_vault("/tmp/vault");
        assert_eq!(config.chunking.max_tokens, 512);
        assert_eq!(config.chunking.target_tokens, 340);
        assert_eq!(config.chunking.overlap_tokens, 64);
        assert_eq!(config.embedding.dim, 384);
        assert_eq!(config.monitor.debounce_ms, 500);
        assert_eq!(config.search.rerank_fanout, 20);
        assert_eq!(config.cache.qembed_capacity, 10_000);
        assert_eq!(config.vault.extensions, vec![".md".to_string()]);
    }

    #[test]
    fn missing_vault_path_is_rejected() {
        let config = EngineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EngineConfig::for_vault("/tmp/vault");
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.vault.path, config.vault.path);
        assert_eq!(parsed.search.timeout_ms, config.search.timeout_ms);
    }
}
