//! MemRag configuration management

use crate::error::{Error, Result};
use crate::memory::{MemoryKind, MAX_TTL_DAYS};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Main MemRag configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemRagConfig {
    /// Hot tier sizing and retrieval defaults
    pub memory: MemoryConfig,

    /// Document chunking policy
    pub chunking: ChunkingConfig,

    /// Importance scoring, TTL and eviction
    pub lifecycle: LifecycleConfig,

    /// Cold tier synchronization
    pub sync: SyncConfig,

    /// Embedding provider selection
    pub embedding: EmbeddingConfig,

    /// HTTP API
    pub api: ApiConfig,
}

impl MemRagConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject option combinations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.memory.embedding_dimension == 0 {
            return Err(Error::Config("embedding_dimension must be > 0".to_string()));
        }
        if self.memory.max_memories == 0 {
            return Err(Error::Config("max_memories must be > 0".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.memory.similarity_floor) {
            return Err(Error::Config(format!(
                "similarity_floor must be within [-1, 1], got {}",
                self.memory.similarity_floor
            )));
        }
        if self.memory.partition.is_empty() || self.memory.partition.contains('/') {
            return Err(Error::Config(format!(
                "invalid partition name '{}'",
                self.memory.partition
            )));
        }
        if self.chunking.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".to_string()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        let w = &self.lifecycle.weights;
        if w.recency < 0.0 || w.frequency < 0.0 || w.kind < 0.0 {
            return Err(Error::Config("importance weights must be non-negative".to_string()));
        }
        if self.lifecycle.sweep_batch_size == 0 {
            return Err(Error::Config("sweep_batch_size must be > 0".to_string()));
        }
        if self.memory.ttl_days > MAX_TTL_DAYS {
            return Err(Error::Config(format!(
                "ttl_days ({}) exceeds the {} day limit",
                self.memory.ttl_days, MAX_TTL_DAYS
            )));
        }
        for (name, over) in &self.lifecycle.kinds {
            name.parse::<MemoryKind>()?;
            if over.ttl_days.map_or(false, |days| days > MAX_TTL_DAYS) {
                return Err(Error::Config(format!(
                    "lifecycle.kinds.{}.ttl_days exceeds the {} day limit",
                    name, MAX_TTL_DAYS
                )));
            }
        }
        if self.sync.max_sync_retries == 0 {
            return Err(Error::Config("max_sync_retries must be > 0".to_string()));
        }
        self.sync.master_key()?;
        Ok(())
    }
}

/// Hot tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Active record count above which the sweep evicts by importance
    pub max_memories: usize,

    /// Default time-to-live for kinds that expire
    pub ttl_days: u32,

    /// Vector length for every record in an index generation
    pub embedding_dimension: usize,

    /// Minimum cosine similarity for a search hit
    pub similarity_floor: f32,

    /// Partition served by this process
    pub partition: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memories: 10_000,
            ttl_days: 30,
            embedding_dimension: 384,
            similarity_floor: 0.7,
            partition: "default".to_string(),
        }
    }
}

/// Document chunking configuration (units are characters)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds between background sweeps
    pub sweep_interval_secs: u64,

    /// Records mutated per write-lock acquisition during a sweep
    pub sweep_batch_size: usize,

    /// Importance older than this is recomputed by the sweep
    pub rescore_after_secs: u64,

    /// Age a tombstone (or an expired archived record) must reach before compaction
    pub tombstone_grace_secs: u64,

    /// Blend weights for the importance model
    pub weights: ImportanceWeights,

    /// Half-life of the recency term, in days
    pub recency_half_life_days: f32,

    /// Access count at which the frequency term saturates
    pub frequency_saturation: u64,

    /// Per-kind overrides of the capability table, keyed by kind name
    pub kinds: BTreeMap<String, KindOverride>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            sweep_batch_size: 256,
            rescore_after_secs: 300,
            tombstone_grace_secs: 86_400,
            weights: ImportanceWeights::default(),
            recency_half_life_days: 30.0,
            frequency_saturation: 100,
            kinds: BTreeMap::new(),
        }
    }
}

/// Importance blend weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceWeights {
    pub recency: f32,
    pub frequency: f32,
    pub kind: f32,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            recency: 0.4,
            frequency: 0.3,
            kind: 0.3,
        }
    }
}

/// Override of one row of the kind capability table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KindOverride {
    /// Kind weight in [0, 1]
    pub weight: Option<f32>,

    /// Kind-specific TTL in days
    pub ttl_days: Option<u32>,

    /// Records of this kind never expire
    pub never_expires: Option<bool>,
}

/// Cold storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdBackendKind {
    /// Local directory tree, one file per object
    Fs,
    /// Process-local object map (tests, ephemeral nodes)
    Memory,
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the periodic background sync
    pub enabled: bool,

    /// Seconds between background syncs
    pub sync_interval_secs: u64,

    /// Attempts per object write before the sync reports degraded
    pub max_sync_retries: u32,

    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,

    /// Objects fetched concurrently during restore
    pub restore_concurrency: usize,

    /// Backend kind
    pub backend: ColdBackendKind,

    /// Bucket name (top-level directory for the fs backend)
    pub bucket: String,

    /// Base directory for the fs backend
    pub base_dir: PathBuf,

    /// Base64 encoded 32-byte master key; objects are encrypted when set
    pub encryption_key: Option<String>,
}

impl SyncConfig {
    /// Decode the configured master key
    pub fn master_key(&self) -> Result<Option<Zeroizing<[u8; 32]>>> {
        let Some(encoded) = &self.encryption_key else {
            return Ok(None);
        };
        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Config(format!("encryption_key is not base64: {}", e)))?,
        );
        if decoded.len() != 32 {
            return Err(Error::Config(format!(
                "encryption_key must decode to 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&decoded);
        Ok(Some(key))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_secs: 60,
            max_sync_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            restore_concurrency: 8,
            backend: ColdBackendKind::Fs,
            bucket: "memrag-cold".to_string(),
            base_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("memrag"),
            encryption_key: None,
        }
    }
}

/// Embedding provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Built-in deterministic feature hashing
    Hash,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,

    /// Base URL of the HTTP provider
    pub endpoint: String,

    /// Model name sent to the HTTP provider
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Attempts before a call surfaces `EmbeddingUnavailable`
    pub max_retries: u32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hash,
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18800,
            cors_origins: Vec::new(),
        }
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        dirs_next::data_local_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemRagConfig::default();
        assert_eq!(config.memory.max_memories, 10_000);
        assert_eq!(config.memory.ttl_days, 30);
        assert_eq!(config.memory.similarity_floor, 0.7);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MemRagConfig = toml::from_str(
            r#"
            [memory]
            max_memories = 2
            ttl_days = 7

            [lifecycle.kinds.working]
            ttl_days = 1
            weight = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.max_memories, 2);
        assert_eq!(config.memory.embedding_dimension, 384);
        assert_eq!(config.lifecycle.kinds["working"].ttl_days, Some(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_chunk() {
        let mut config = MemRagConfig::default();
        config.chunking.chunk_overlap = 1000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_kind_override() {
        let mut config = MemRagConfig::default();
        config
            .lifecycle
            .kinds
            .insert("dream".to_string(), KindOverride::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_ttl() {
        let mut config = MemRagConfig::default();
        config.memory.ttl_days = u32::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = MemRagConfig::default();
        config.lifecycle.kinds.insert(
            "episodic".to_string(),
            KindOverride {
                ttl_days: Some(u32::MAX),
                ..KindOverride::default()
            },
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_master_key_decoding() {
        let mut sync = SyncConfig::default();
        assert!(sync.master_key().unwrap().is_none());

        sync.encryption_key = Some(base64::engine::general_purpose::STANDARD.encode([7u8; 32]));
        let key = sync.master_key().unwrap().unwrap();
        assert_eq!(*key, [7u8; 32]);

        sync.encryption_key = Some(base64::engine::general_purpose::STANDARD.encode([7u8; 16]));
        assert!(sync.master_key().is_err());
    }

    #[test]
    fn test_round_trip_toml() {
        let config = MemRagConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: MemRagConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.api.port, 18800);
        assert_eq!(parsed.sync.backend, ColdBackendKind::Fs);
    }
}
