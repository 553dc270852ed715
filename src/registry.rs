//! Capability registry
//!
//! Maps each pluggable capability to a concrete implementation once, at
//! startup. Nothing is looked up by name after `resolve`.
//!
//! ```text
//! MemRagConfig ──► CapabilityRegistry::from_config ──► resolve() ──► Capabilities
//!                   .with_embedding(..)                                ├── embedder
//!                   .with_cold_storage(..)                             ├── cold
//!                   .with_ranking(mode, ..)                            └── rankers
//! ```

use crate::config::{ColdBackendKind, EmbeddingProviderKind, MemRagConfig};
use crate::embedding::{EmbeddingProvider, HashEmbedder, HttpEmbedder, RetryingEmbedder};
use crate::error::{Error, Result};
use crate::retrieval::{RankingMode, RankingStrategy, WeightedRanking};
use crate::sync::{ColdStorage, FsColdStorage, MemoryColdStorage, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Resolved implementations handed to the memory system
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub cold: Arc<dyn ColdStorage>,
    pub rankers: HashMap<RankingMode, Arc<dyn RankingStrategy>>,
}

/// Collects capability implementations before the system starts
#[derive(Default)]
pub struct CapabilityRegistry {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cold: Option<Arc<dyn ColdStorage>>,
    rankers: HashMap<RankingMode, Arc<dyn RankingStrategy>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from the `[embedding]` and `[sync]` sections
    pub fn from_config(config: &MemRagConfig) -> Result<Self> {
        let dimension = config.memory.embedding_dimension;
        let base: Arc<dyn EmbeddingProvider> = match config.embedding.provider {
            EmbeddingProviderKind::Hash => Arc::new(HashEmbedder::new(dimension)),
            EmbeddingProviderKind::Http => {
                Arc::new(HttpEmbedder::new(&config.embedding, dimension)?)
            }
        };
        let policy = RetryPolicy {
            max_attempts: config.embedding.max_retries.max(1),
            initial_delay: Duration::from_millis(config.sync.initial_backoff_ms),
            max_delay: Duration::from_millis(config.sync.max_backoff_ms),
            multiplier: 2.0,
        };
        let embedder = Arc::new(RetryingEmbedder::new(base, policy));

        let cold: Arc<dyn ColdStorage> = match config.sync.backend {
            ColdBackendKind::Fs => Arc::new(FsColdStorage::new(
                &config.sync.base_dir,
                &config.sync.bucket,
            )?),
            ColdBackendKind::Memory => Arc::new(MemoryColdStorage::new()),
        };

        Ok(Self::new().with_embedding(embedder).with_cold_storage(cold))
    }

    pub fn with_embedding(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_cold_storage(mut self, cold: Arc<dyn ColdStorage>) -> Self {
        self.cold = Some(cold);
        self
    }

    pub fn with_ranking(mut self, mode: RankingMode, strategy: Arc<dyn RankingStrategy>) -> Self {
        self.rankers.insert(mode, strategy);
        self
    }

    /// Fix the implementation of every capability; rankers default to the built-ins
    pub fn resolve(mut self) -> Result<Capabilities> {
        let embedder = self
            .embedder
            .ok_or_else(|| Error::Config("no embedding provider registered".to_string()))?;
        let cold = self
            .cold
            .ok_or_else(|| Error::Config("no cold storage registered".to_string()))?;
        for mode in RankingMode::ALL {
            self.rankers
                .entry(mode)
                .or_insert_with(|| Arc::new(WeightedRanking::for_mode(mode)));
        }
        info!(
            embedder = embedder.name(),
            dimension = embedder.dimension(),
            cold = cold.name(),
            "Capabilities resolved"
        );
        Ok(Capabilities {
            embedder,
            cold,
            rankers: self.rankers,
        })
    }
}
