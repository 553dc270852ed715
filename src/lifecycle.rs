//! Record lifecycle: importance scoring, TTL and capacity eviction
//!
//! Records move one way through `active → archived → deleted`:
//!
//! - `sweep` archives every expired record, then, if the hot set is still
//!   over `max_memories`, archives the least important records. Expiry is
//!   handled first, so an expired record never survives because it scored
//!   well.
//! - `compact` tombstones archived records whose expiry is past the grace
//!   period and physically drops tombstones older than the grace period.
//!
//! Mutations are applied in batches of `sweep_batch_size` with a yield in
//! between, so queries are never starved by one long write lock.

use crate::config::{ImportanceWeights, LifecycleConfig, MemRagConfig};
use crate::error::Result;
use crate::index::EmbeddingIndex;
use crate::memory::{KindTable, MemoryKind, MemoryRecord, RecordStore, ScanFilter, Tombstone};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Blend of recency, access frequency and kind weight
#[derive(Debug, Clone)]
pub struct ImportanceModel {
    weights: ImportanceWeights,
    half_life_days: f64,
    saturation: u64,
    kinds: KindTable,
}

impl ImportanceModel {
    pub fn new(config: &LifecycleConfig, kinds: KindTable) -> Self {
        Self {
            weights: config.weights,
            half_life_days: config.recency_half_life_days.max(f32::EPSILON) as f64,
            saturation: config.frequency_saturation.max(1),
            kinds,
        }
    }

    /// Recency term: exponential decay since last activity, 1.0 when fresh
    pub fn recency(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
        let age = now - record.last_activity();
        let age_days = (age.num_seconds().max(0) as f64) / 86_400.0;
        (-(age_days * std::f64::consts::LN_2) / self.half_life_days).exp() as f32
    }

    /// Frequency term: log-scaled access count, 1.0 at saturation
    pub fn frequency(&self, access_count: u64) -> f32 {
        let n = access_count.min(self.saturation) as f64;
        ((1.0 + n).ln() / (1.0 + self.saturation as f64).ln()) as f32
    }

    pub fn kind_weight(&self, kind: MemoryKind) -> f32 {
        self.kinds.get(kind).weight
    }

    /// Importance of `record` at `now`, in [0, 1]
    pub fn score(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
        let w = &self.weights;
        let raw = w.recency * self.recency(record, now)
            + w.frequency * self.frequency(record.access_count)
            + w.kind * self.kind_weight(record.kind);
        raw.clamp(0.0, 1.0)
    }
}

/// Outcome of one `sweep`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Archived because `expires_at <= now`
    pub expired: Vec<Uuid>,
    /// Archived because the hot set was over capacity
    pub evicted: Vec<Uuid>,
    /// Records whose stale importance was recomputed
    pub rescored: usize,
    /// Write batches applied
    pub batches: usize,
}

/// Outcome of one `compact`
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactReport {
    /// Archived records turned into tombstones
    pub tombstoned: usize,
    /// Tombstones physically removed; the synchronizer must still mirror them
    pub purged: Vec<Tombstone>,
}

/// Drives importance, archival and physical deletion for one partition
pub struct LifecycleManager {
    store: Arc<RecordStore>,
    index: Arc<EmbeddingIndex>,
    model: ImportanceModel,
    kinds: KindTable,
    max_memories: usize,
    default_ttl_days: u32,
    batch_size: usize,
    rescore_after: Duration,
    grace: Duration,
}

impl LifecycleManager {
    pub fn new(
        config: &MemRagConfig,
        store: Arc<RecordStore>,
        index: Arc<EmbeddingIndex>,
    ) -> Result<Self> {
        let kinds = KindTable::from_config(&config.lifecycle)?;
        Ok(Self {
            store,
            index,
            model: ImportanceModel::new(&config.lifecycle, kinds.clone()),
            kinds,
            max_memories: config.memory.max_memories,
            default_ttl_days: config.memory.ttl_days,
            batch_size: config.lifecycle.sweep_batch_size.max(1),
            rescore_after: Duration::seconds(config.lifecycle.rescore_after_secs as i64),
            grace: Duration::seconds(config.lifecycle.tombstone_grace_secs as i64),
        })
    }

    pub fn model(&self) -> &ImportanceModel {
        &self.model
    }

    /// Kind capability table in effect
    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    pub fn default_ttl_days(&self) -> u32 {
        self.default_ttl_days
    }

    pub fn max_memories(&self) -> usize {
        self.max_memories
    }

    /// Score assigned at ingestion, before any access
    pub fn initial_score(&self, record: &MemoryRecord) -> f32 {
        self.model.score(record, record.created_at)
    }

    /// Overwrite one record's importance and mirror it into the index
    pub async fn set_importance(&self, id: Uuid, importance: f32) -> Option<MemoryRecord> {
        let updated = self
            .store
            .set_importance(&[(id, importance)], Utc::now())
            .await
            .pop()?;
        self.index.update_meta(&updated).await;
        Some(updated)
    }

    /// Recompute importance right after a retrieval hit
    pub async fn refresh_on_access(&self, record: &MemoryRecord, now: DateTime<Utc>) {
        let score = self.model.score(record, now);
        if let Some(updated) = self.store.set_importance(&[(record.id, score)], now).await.pop() {
            self.index.update_meta(&updated).await;
        }
    }

    /// Archive expired records, then evict by importance down to `max_memories`
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();
        let (active, _) = self.store.scan(ScanFilter::active()).await.collect_records();

        let stale: Vec<(Uuid, f32)> = active
            .iter()
            .filter(|r| now - r.importance_scored_at >= self.rescore_after)
            .map(|r| (r.id, self.model.score(r, now)))
            .collect();
        for batch in stale.chunks(self.batch_size) {
            for updated in self.store.set_importance(batch, now).await {
                self.index.update_meta(&updated).await;
            }
            report.rescored += batch.len();
            report.batches += 1;
            tokio::task::yield_now().await;
        }

        let expired: Vec<Uuid> = active
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        for batch in expired.chunks(self.batch_size) {
            report.expired.extend(self.archive_batch(batch).await);
            report.batches += 1;
            tokio::task::yield_now().await;
        }

        let remaining = self.store.active_len().await;
        if remaining > self.max_memories {
            let excess = remaining - self.max_memories;
            let (mut candidates, _) = self.store.scan(ScanFilter::active()).await.collect_records();
            candidates.sort_by(|a, b| eviction_order(a, b));
            let victims: Vec<Uuid> = candidates.iter().take(excess).map(|r| r.id).collect();
            for batch in victims.chunks(self.batch_size) {
                report.evicted.extend(self.archive_batch(batch).await);
                report.batches += 1;
                tokio::task::yield_now().await;
            }
        }

        if !report.expired.is_empty() || !report.evicted.is_empty() {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                rescored = report.rescored,
                "Lifecycle sweep archived records"
            );
        } else {
            debug!(rescored = report.rescored, "Lifecycle sweep complete");
        }
        Ok(report)
    }

    async fn archive_batch(&self, ids: &[Uuid]) -> Vec<Uuid> {
        let archived = self.store.archive(ids).await;
        self.index.remove_many(&archived).await;
        archived
    }

    /// Tombstone long-expired archived records and drop old tombstones
    pub async fn compact(&self) -> Result<CompactReport> {
        let now = Utc::now();
        let mut report = CompactReport::default();

        let (archived, _) = self.store.scan(ScanFilter::archived()).await.collect_records();
        let doomed: Vec<Uuid> = archived
            .iter()
            .filter(|r| r.expires_at.map_or(false, |at| at + self.grace <= now))
            .map(|r| r.id)
            .collect();
        for batch in doomed.chunks(self.batch_size) {
            for id in batch {
                if self.store.delete(id).await.is_ok() {
                    report.tombstoned += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        report.purged = self.store.purge_tombstones(self.grace, Utc::now()).await;
        if report.tombstoned > 0 || !report.purged.is_empty() {
            info!(
                tombstoned = report.tombstoned,
                purged = report.purged.len(),
                "Lifecycle compaction"
            );
        }
        Ok(report)
    }
}

/// Lowest importance first; ties go to the oldest activity, then the oldest record
fn eviction_order(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    a.importance
        .partial_cmp(&b.importance)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.last_activity().cmp(&b.last_activity()))
        .then_with(|| a.created_at.cmp(&b.created_at))
}
