//! Caller-facing memory system
//!
//! `MemorySystem` wires the record store, index, lifecycle manager,
//! retrieval engine and synchronizer of one partition together and exposes
//! the operations callers use.
//!
//! Ingestion is serialized per partition by the ingest lock so a `put` and
//! its `index` are atomic from the caller's point of view. Embedding runs
//! before the lock is taken, so slow providers never block other writers.
//! Restore takes the same lock and blocks the partition until it finishes.

use crate::config::MemRagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::EmbeddingIndex;
use crate::lifecycle::{CompactReport, LifecycleManager, SweepReport};
use crate::memory::{
    chunker, Chunker, MemoryKind, MemoryRecord, RecordBuilder, RecordStore, ScanFilter, TtlChoice,
};
use crate::registry::{Capabilities, CapabilityRegistry};
use crate::retrieval::{QueryRequest, QueryResult, RetrievalEngine};
use crate::sync::{BackupReport, RestoreReport, SyncReport, SyncStatus, Synchronizer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input of `add_record_with` and `add_records`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub ttl: TtlChoice,
}

impl NewRecord {
    pub fn new(kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: HashMap::new(),
            ttl: TtlChoice::Policy,
        }
    }

    pub fn ttl(mut self, ttl: TtlChoice) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-item failure in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    /// Position in the submitted batch (chunk number for documents)
    pub index: usize,
    pub error: String,
}

/// Outcome of a batch or document ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: Vec<Uuid>,
    pub failed: Vec<IngestFailure>,
}

/// Reassembled document text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub doc_id: String,
    pub text: String,
    pub chunk_count: usize,
}

/// Operational counters
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub partition: String,
    /// Active records
    pub record_count: usize,
    pub archived_count: usize,
    pub tombstone_count: usize,
    /// Vectors in the hot index
    pub index_size: usize,
    /// Fraction of queries that returned at least one record
    pub hit_rate: f64,
    pub query_count: u64,
    /// Store changes not yet mirrored to cold storage
    pub storage_lag: u64,
    pub sync_degraded: bool,
    pub store_version: u64,
    pub checkpoint_sequence: u64,
    pub embedder: String,
    pub cold_backend: String,
}

/// Tiered memory store for one partition
pub struct MemorySystem {
    config: MemRagConfig,
    store: Arc<RecordStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    lifecycle: Arc<LifecycleManager>,
    retrieval: RetrievalEngine,
    sync: Synchronizer,
    chunker: Chunker,
    ingest: Mutex<()>,
}

impl MemorySystem {
    /// Build a system with capabilities resolved from `config`
    pub fn new(config: MemRagConfig) -> Result<Self> {
        config.validate()?;
        let capabilities = CapabilityRegistry::from_config(&config)?.resolve()?;
        Self::with_capabilities(config, capabilities)
    }

    /// Build a system around already-resolved capabilities
    pub fn with_capabilities(config: MemRagConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        let dimension = config.memory.embedding_dimension;
        if capabilities.embedder.dimension() != dimension {
            return Err(Error::Config(format!(
                "embedder '{}' produces {} dimensions, embedding_dimension is {}",
                capabilities.embedder.name(),
                capabilities.embedder.dimension(),
                dimension
            )));
        }

        let store = Arc::new(RecordStore::new(config.memory.partition.clone(), dimension));
        let index = Arc::new(EmbeddingIndex::new(dimension));
        let lifecycle = Arc::new(LifecycleManager::new(&config, store.clone(), index.clone())?);
        let retrieval = RetrievalEngine::new(
            store.clone(),
            index.clone(),
            capabilities.embedder.clone(),
            lifecycle.clone(),
            capabilities.rankers,
            config.memory.similarity_floor,
        );
        let sync = Synchronizer::new(&config.sync, store.clone(), index.clone(), capabilities.cold)?;
        let chunker = Chunker::from_config(&config.chunking)?;

        info!(
            partition = %config.memory.partition,
            dimension,
            max_memories = config.memory.max_memories,
            "Memory system ready"
        );
        Ok(Self {
            config,
            store,
            index,
            embedder: capabilities.embedder,
            lifecycle,
            retrieval,
            sync,
            chunker,
            ingest: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &MemRagConfig {
        &self.config
    }

    pub fn partition(&self) -> &str {
        self.store.partition()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    /// Ingest one record, returning its id
    pub async fn add_record(
        &self,
        kind: MemoryKind,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid> {
        let mut new = NewRecord::new(kind, content);
        new.metadata = metadata;
        self.add_record_with(new).await
    }

    pub async fn add_record_with(&self, new: NewRecord) -> Result<Uuid> {
        if new.content.trim().is_empty() {
            return Err(Error::Validation("record content is required".to_string()));
        }
        let embedding = self.embedder.embed(&new.content).await?;
        let builder = RecordBuilder::new(new.kind)
            .content(new.content)
            .metadata_map(new.metadata)
            .ttl(new.ttl);
        self.insert(builder, embedding).await
    }

    /// Score, persist and index one record under the ingest lock
    async fn insert(&self, builder: RecordBuilder, embedding: Vec<f32>) -> Result<Uuid> {
        self.index.check_dimension(embedding.len())?;
        let mut record = builder
            .embedding(embedding)
            .policy(self.lifecycle.kinds(), self.lifecycle.default_ttl_days())
            .build()?;
        record.importance = self.lifecycle.initial_score(&record);
        let id = record.id;

        let _guard = self.ingest.lock().await;
        self.store.put(record.clone()).await?;
        if let Err(e) = self.index_stored(&record).await {
            self.store.remove_hard(&id).await;
            return Err(e);
        }
        debug!(id = %id, kind = %record.kind, "Record ingested");
        Ok(id)
    }

    /// Index a record that is already in the store.
    ///
    /// Sweeps run without the ingest lock, so the stored copy may have been
    /// archived since `record` was cloned; such a record leaves the index again.
    async fn index_stored(&self, record: &MemoryRecord) -> Result<()> {
        self.index.index(record).await?;
        let archived = self.store.get(&record.id).await.map_or(true, |r| r.archived);
        if archived {
            self.index.remove(&record.id).await;
            debug!(id = %record.id, "Record archived during ingest");
        }
        Ok(())
    }

    /// Ingest a batch; one bad item never aborts the rest
    pub async fn add_records(&self, records: Vec<NewRecord>) -> IngestReport {
        let mut report = IngestReport::default();
        for (index, new) in records.into_iter().enumerate() {
            match self.add_record_with(new).await {
                Ok(id) => report.accepted.push(id),
                Err(e) => {
                    warn!(index, error = %e, "Batch item rejected");
                    report.failed.push(IngestFailure {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Chunk a document and ingest every chunk as a semantic record.
    ///
    /// Chunks of an earlier version of the same document are deleted first.
    pub async fn add_document(
        &self,
        doc_id: &str,
        text: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<IngestReport> {
        if doc_id.is_empty() || doc_id.contains('/') || doc_id == "." || doc_id == ".." {
            return Err(Error::Validation(format!("invalid document id '{}'", doc_id)));
        }
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(Error::Validation(format!("document '{}' has no text", doc_id)));
        }

        let (previous, _) = self
            .store
            .scan(ScanFilter::all().document(doc_id))
            .await
            .collect_records();
        for old in previous {
            self.delete(&old.id).await?;
        }

        let mut report = IngestReport::default();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let result = match self.embedder.embed(&chunk.text).await {
                Ok(embedding) => {
                    let builder = RecordBuilder::new(MemoryKind::Semantic)
                        .content(chunk.text)
                        .chunk(doc_id, chunk.offset)
                        .metadata_map(metadata.clone())
                        .metadata("chunk_index", serde_json::json!(index));
                    self.insert(builder, embedding).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(id) => report.accepted.push(id),
                Err(e) => report.failed.push(IngestFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        info!(
            doc_id,
            chunks = report.accepted.len(),
            failed = report.failed.len(),
            "Document ingested"
        );
        Ok(report)
    }

    /// Reassemble a document from its live chunks
    pub async fn document(&self, doc_id: &str) -> Result<Document> {
        let (chunks, _) = self
            .store
            .scan(ScanFilter::all().document(doc_id))
            .await
            .collect_records();
        if chunks.is_empty() {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let text = chunker::reassemble(chunks.iter().filter_map(|r| {
            r.chunk
                .as_ref()
                .map(|c| (c.chunk_offset, r.content.as_str()))
        }));
        Ok(Document {
            doc_id: doc_id.to_string(),
            text,
            chunk_count: chunks.len(),
        })
    }

    /// Direct fetch by id; archived records are included
    /// Fetch a record by id, falling back to the cold mirror for records
    /// the hot tier no longer holds. A cold outage reads as `NotFound`.
    pub async fn get(&self, id: &Uuid) -> Result<MemoryRecord> {
        match self.find(id).await {
            Err(e) if e.is_transient() => {
                warn!(id = %id, error = %e, "Cold lookup failed");
                Err(Error::NotFound(format!("record {}", id)))
            }
            result => result,
        }
    }

    async fn find(&self, id: &Uuid) -> Result<MemoryRecord> {
        match self.store.get(id).await {
            Err(Error::NotFound(_)) if !self.store.is_tombstoned(id).await => self
                .sync
                .fetch_cold(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("record {}", id))),
            result => result,
        }
    }

    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let _guard = self.ingest.lock().await;
        self.store.delete(id).await?;
        self.index.remove(id).await;
        Ok(())
    }

    /// Top `k` records for `text`
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        kinds: Option<Vec<MemoryKind>>,
        deadline: Option<Duration>,
    ) -> Result<QueryResult> {
        let mut request = QueryRequest::new(text, k);
        request.kinds = kinds;
        request.deadline = deadline;
        self.retrieval.query(&request).await
    }

    pub async fn query_with(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.retrieval.query(request).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.lifecycle.sweep().await
    }

    /// Compact and hand purged tombstones to the synchronizer
    pub async fn compact(&self) -> Result<CompactReport> {
        let report = self.lifecycle.compact().await?;
        self.sync.enqueue_tombstones(report.purged.clone()).await;
        Ok(report)
    }

    pub async fn sync(&self) -> SyncReport {
        self.sync.sync(&CancellationToken::new()).await
    }

    pub async fn sync_with(&self, cancel: &CancellationToken) -> SyncReport {
        self.sync.sync(cancel).await
    }

    /// Rebuild the hot tier from the cold mirror of `partition`
    pub async fn restore(&self, partition: &str) -> Result<RestoreReport> {
        self.restore_with(partition, &CancellationToken::new()).await
    }

    pub async fn restore_with(
        &self,
        partition: &str,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let _guard = self.ingest.lock().await;
        self.sync.restore(partition, cancel).await
    }

    pub async fn restore_snapshot(&self, partition: &str, snapshot_id: &str) -> Result<RestoreReport> {
        let _guard = self.ingest.lock().await;
        self.sync
            .restore_snapshot(partition, snapshot_id, &CancellationToken::new())
            .await
    }

    pub async fn backup_full(&self) -> Result<BackupReport> {
        self.sync.backup_full(&CancellationToken::new()).await
    }

    pub async fn list_snapshots(&self, partition: &str) -> Result<Vec<String>> {
        self.sync.list_snapshots(partition).await
    }

    /// Copy an archived record into a new active record.
    ///
    /// The original stays archived; the copy gets a fresh id, a fresh TTL
    /// and `restored_from` pointing back. Falls back to the cold mirror when
    /// the hot tier no longer holds the original.
    pub async fn reactivate(&self, id: &Uuid) -> Result<Uuid> {
        let original = self.find(id).await?;
        if !original.archived {
            return Err(Error::Validation(format!("record {} is still active", id)));
        }

        let embedding = if original.embedding.len() == self.index.dimension() {
            original.embedding.clone()
        } else {
            self.embedder.embed(&original.content).await?
        };
        let mut builder = RecordBuilder::new(original.kind)
            .content(original.content.clone())
            .metadata_map(original.metadata.clone())
            .restored_from(original.id);
        if let Some(chunk) = &original.chunk {
            builder = builder
                .metadata("source_doc_id", serde_json::json!(chunk.source_doc_id))
                .metadata("chunk_offset", serde_json::json!(chunk.chunk_offset));
        }
        let new_id = self.insert(builder, embedding).await?;
        info!(original = %id, id = %new_id, "Record reactivated");
        Ok(new_id)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.sync.status().await
    }

    pub async fn stats(&self) -> Stats {
        let counts = self.store.counts().await;
        let status = self.sync.status().await;
        Stats {
            partition: self.partition().to_string(),
            record_count: counts.active,
            archived_count: counts.archived,
            tombstone_count: counts.tombstoned,
            index_size: self.index.len().await,
            hit_rate: self.retrieval.hit_rate(),
            query_count: self.retrieval.query_count(),
            storage_lag: self.sync.lag().await,
            sync_degraded: status.degraded,
            store_version: self.store.version(),
            checkpoint_sequence: status.checkpoint.sequence,
            embedder: self.embedder.name().to_string(),
            cold_backend: status.backend,
        }
    }

    /// Start the periodic lifecycle and sync loops
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let system = Arc::clone(self);
        let token = cancel.clone();
        let every = Duration::from_secs(self.config.lifecycle.sweep_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = system.sweep().await {
                    warn!(error = %e, "Lifecycle sweep failed");
                }
                if let Err(e) = system.compact().await {
                    warn!(error = %e, "Lifecycle compaction failed");
                }
            }
            debug!("Lifecycle loop stopped");
        }));

        if self.config.sync.enabled {
            let system = Arc::clone(self);
            let token = cancel;
            let every = Duration::from_secs(self.config.sync.sync_interval_secs.max(1));
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    system.sync_with(&token).await;
                }
                debug!("Sync loop stopped");
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColdBackendKind;
    use crate::embedding::testing::FlakyEmbedder;
    use crate::embedding::HashEmbedder;
    use crate::sync::MemoryColdStorage;

    const DIM: usize = 64;

    fn config() -> MemRagConfig {
        let mut config = MemRagConfig::default();
        config.memory.embedding_dimension = DIM;
        config.sync.backend = ColdBackendKind::Memory;
        config.sync.max_sync_retries = 2;
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_ms = 2;
        config.chunking.chunk_size = 100;
        config.chunking.chunk_overlap = 20;
        config
    }

    fn system() -> MemorySystem {
        MemorySystem::new(config()).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_round_trip() {
        let system = system();
        let id = system
            .add_record(
                MemoryKind::Preference,
                "prefers concise answers",
                HashMap::from([("source".to_string(), serde_json::json!("chat"))]),
            )
            .await
            .unwrap();
        let record = system.get(&id).await.unwrap();
        assert_eq!(record.content, "prefers concise answers");
        assert_eq!(record.kind, MemoryKind::Preference);
        assert!(record.expires_at.is_none());
        assert!(record.importance > 0.0);
        assert_eq!(record.metadata["source"], "chat");
        assert_eq!(system.stats().await.index_size, 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_before_persist() {
        let caps = CapabilityRegistry::new()
            .with_embedding(Arc::new(HashEmbedder::new(DIM)))
            .with_cold_storage(Arc::new(MemoryColdStorage::new()))
            .resolve()
            .unwrap();
        let mut cfg = config();
        cfg.memory.embedding_dimension = DIM + 1;
        assert!(matches!(
            MemorySystem::with_capabilities(cfg, caps),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let system = system();
        let report = system
            .add_records(vec![
                NewRecord::new(MemoryKind::Episodic, "first"),
                NewRecord::new(MemoryKind::Episodic, "   "),
                NewRecord::new(MemoryKind::Working, "third"),
            ])
            .await;
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 1);
    }

    #[tokio::test]
    async fn test_embedding_outage_fails_ingest_but_query_degrades() {
        let flaky = Arc::new(FlakyEmbedder::new(DIM));
        let caps = CapabilityRegistry::new()
            .with_embedding(flaky.clone())
            .with_cold_storage(Arc::new(MemoryColdStorage::new()))
            .resolve()
            .unwrap();
        let system = MemorySystem::with_capabilities(config(), caps).unwrap();
        system
            .add_record(MemoryKind::Semantic, "the office wifi password rotates monthly", HashMap::new())
            .await
            .unwrap();

        flaky.set_down(true);
        assert!(matches!(
            system
                .add_record(MemoryKind::Semantic, "more", HashMap::new())
                .await,
            Err(Error::EmbeddingUnavailable(_))
        ));
        let result = system.query("wifi password", 3, None, None).await.unwrap();
        assert!(result.degraded);
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_document_round_trip_and_replace() {
        let system = system();
        let text = "Memory systems keep recent context hot. ".repeat(12);
        let report = system.add_document("guide", &text, HashMap::new()).await.unwrap();
        assert!(report.accepted.len() > 1);
        assert!(report.failed.is_empty());

        let doc = system.document("guide").await.unwrap();
        assert_eq!(doc.text, text);
        assert_eq!(doc.chunk_count, report.accepted.len());

        let chunk = system.get(&report.accepted[0]).await.unwrap();
        assert_eq!(chunk.kind, MemoryKind::Semantic);
        assert_eq!(chunk.chunk.as_ref().unwrap().source_doc_id, "guide");

        system.add_document("guide", "Short replacement.", HashMap::new()).await.unwrap();
        assert_eq!(system.document("guide").await.unwrap().text, "Short replacement.");
        assert!(system.get(&report.accepted[0]).await.is_err());

        assert!(matches!(system.document("missing").await, Err(Error::NotFound(_))));
        assert!(system.add_document("a/b", "text", HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_from_search() {
        let system = system();
        let id = system
            .add_record(MemoryKind::Semantic, "ephemeral fact", HashMap::new())
            .await
            .unwrap();
        system.delete(&id).await.unwrap();
        assert!(matches!(system.get(&id).await, Err(Error::NotFound(_))));
        let result = system.query("ephemeral fact", 3, None, None).await.unwrap();
        assert!(result.hits.is_empty());
        assert_eq!(system.stats().await.tombstone_count, 1);
    }

    #[tokio::test]
    async fn test_reactivate_archived_record() {
        let system = system();
        let id = system
            .add_record_with(
                NewRecord::new(MemoryKind::Episodic, "trip to lisbon").ttl(TtlChoice::Days(0)),
            )
            .await
            .unwrap();
        assert!(matches!(system.reactivate(&id).await, Err(Error::Validation(_))));

        system.sweep().await.unwrap();
        let new_id = system.reactivate(&id).await.unwrap();
        assert_ne!(new_id, id);

        let copy = system.get(&new_id).await.unwrap();
        assert_eq!(copy.restored_from, Some(id));
        assert!(!copy.archived);
        assert!(!copy.is_expired(chrono::Utc::now()));
        assert!(system.get(&id).await.unwrap().archived);

        let result = system.query("trip to lisbon", 3, None, None).await.unwrap();
        assert_eq!(result.hits[0].record.id, new_id);
    }

    #[tokio::test]
    async fn test_reactivate_from_cold() {
        let cfg = config();
        let cold = Arc::new(MemoryColdStorage::new());
        let caps = || {
            CapabilityRegistry::new()
                .with_embedding(Arc::new(HashEmbedder::new(DIM)))
                .with_cold_storage(cold.clone())
                .resolve()
                .unwrap()
        };
        let first = MemorySystem::with_capabilities(cfg.clone(), caps()).unwrap();
        let id = first
            .add_record_with(NewRecord::new(MemoryKind::Working, "scratch note").ttl(TtlChoice::Days(0)))
            .await
            .unwrap();
        first.sweep().await.unwrap();
        assert!(!first.sync().await.degraded);

        let second = MemorySystem::with_capabilities(cfg, caps()).unwrap();
        let new_id = second.reactivate(&id).await.unwrap();
        assert_eq!(second.get(&new_id).await.unwrap().restored_from, Some(id));
        assert!(matches!(
            second.reactivate(&Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archived_record_addressable_after_restore() {
        let cfg = config();
        let cold = Arc::new(MemoryColdStorage::new());
        let caps = || {
            CapabilityRegistry::new()
                .with_embedding(Arc::new(HashEmbedder::new(DIM)))
                .with_cold_storage(cold.clone())
                .resolve()
                .unwrap()
        };
        let first = MemorySystem::with_capabilities(cfg.clone(), caps()).unwrap();
        let id = first
            .add_record_with(NewRecord::new(MemoryKind::Episodic, "offsite in porto").ttl(TtlChoice::Days(0)))
            .await
            .unwrap();
        first.sweep().await.unwrap();
        assert!(!first.sync().await.degraded);

        // Not restored yet: served straight from the mirror
        let cold_only = MemorySystem::with_capabilities(cfg.clone(), caps()).unwrap();
        assert!(cold_only.get(&id).await.unwrap().archived);

        let restored = MemorySystem::with_capabilities(cfg, caps()).unwrap();
        let report = restored.restore(restored.partition()).await.unwrap();
        assert_eq!(report.archived_count, 1);
        let record = restored.get(&id).await.unwrap();
        assert!(record.archived);
        assert_eq!(record.content, "offsite in porto");
        assert_eq!(restored.stats().await.index_size, 0);
        assert!(matches!(restored.get(&Uuid::new_v4()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reactivate_archived_chunk_from_cold() {
        let cfg = config();
        let cold = Arc::new(MemoryColdStorage::new());
        let caps = || {
            CapabilityRegistry::new()
                .with_embedding(Arc::new(HashEmbedder::new(DIM)))
                .with_cold_storage(cold.clone())
                .resolve()
                .unwrap()
        };
        let first = MemorySystem::with_capabilities(cfg.clone(), caps()).unwrap();
        let text = "Archived chunks must stay reachable by id. ".repeat(6);
        let report = first.add_document("notes", &text, HashMap::new()).await.unwrap();
        let chunk_id = report.accepted[1];
        first.store.archive(&[chunk_id]).await;
        first.index.remove(&chunk_id).await;
        assert!(!first.sync().await.degraded);

        let second = MemorySystem::with_capabilities(cfg, caps()).unwrap();
        let archived = second.get(&chunk_id).await.unwrap();
        assert!(archived.archived);
        assert_eq!(archived.chunk.as_ref().unwrap().source_doc_id, "notes");

        let new_id = second.reactivate(&chunk_id).await.unwrap();
        let copy = second.get(&new_id).await.unwrap();
        assert_eq!(copy.restored_from, Some(chunk_id));
        assert_eq!(copy.metadata["source_doc_id"], "notes");
    }

    #[tokio::test]
    async fn test_deleted_record_not_served_from_cold() {
        let cold = Arc::new(MemoryColdStorage::new());
        let caps = CapabilityRegistry::new()
            .with_embedding(Arc::new(HashEmbedder::new(DIM)))
            .with_cold_storage(cold)
            .resolve()
            .unwrap();
        let system = MemorySystem::with_capabilities(config(), caps).unwrap();
        let id = system
            .add_record(MemoryKind::Semantic, "revoked token", HashMap::new())
            .await
            .unwrap();
        assert!(!system.sync().await.degraded);

        system.delete(&id).await.unwrap();
        assert!(matches!(system.get(&id).await, Err(Error::NotFound(_))));
        assert!(matches!(system.reactivate(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_archived_mid_ingest_leaves_index() {
        let system = system();
        let record = RecordBuilder::new(MemoryKind::Working)
            .content("expires at once")
            .embedding(vec![0.1; DIM])
            .ttl(TtlChoice::Days(0))
            .build()
            .unwrap();
        system.store.put(record.clone()).await.unwrap();
        assert_eq!(system.lifecycle.sweep().await.unwrap().expired, vec![record.id]);

        system.index_stored(&record).await.unwrap();
        let stats = system.stats().await;
        assert_eq!(stats.index_size, 0);
        assert_eq!(stats.archived_count, 1);
        assert!(system.query("expires at once", 3, None, None).await.unwrap().hits.is_empty());
    }

    #[tokio::test]
    async fn test_compact_forwards_tombstones() {
        let mut cfg = config();
        cfg.lifecycle.tombstone_grace_secs = 0;
        let system = MemorySystem::new(cfg).unwrap();
        let id = system
            .add_record(MemoryKind::Working, "to be removed", HashMap::new())
            .await
            .unwrap();
        system.delete(&id).await.unwrap();

        let report = system.compact().await.unwrap();
        assert_eq!(report.purged.len(), 1);
        let sync = system.sync().await;
        assert!(!sync.degraded);
        assert_eq!(sync.tombstones_written, 1);
        assert_eq!(system.sync_status().await.pending_tombstones, 0);
    }

    #[tokio::test]
    async fn test_stats_track_lag() {
        let system = system();
        system
            .add_record(MemoryKind::Semantic, "a", HashMap::new())
            .await
            .unwrap();
        let before = system.stats().await;
        assert_eq!(before.record_count, 1);
        assert_eq!(before.storage_lag, 1);
        assert_eq!(before.embedder, "hash");

        system.sync().await;
        assert_eq!(system.stats().await.storage_lag, 0);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_cancel() {
        let mut cfg = config();
        cfg.lifecycle.sweep_interval_secs = 1;
        cfg.sync.sync_interval_secs = 1;
        let system = Arc::new(MemorySystem::new(cfg).unwrap());
        let cancel = CancellationToken::new();
        let handles = system.spawn_background(cancel.clone());
        assert_eq!(handles.len(), 2);
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
