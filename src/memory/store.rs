//! In-memory record store for the hot tier
//!
//! Authoritative table of `MemoryRecord`s for one partition, guarded by a
//! `tokio::sync::RwLock`. Records are held behind `Arc` and replaced
//! copy-on-write, so a `Scan` taken under the read lock is a consistent
//! snapshot that later mutations never touch.
//!
//! Every `put`, `delete` and archival bumps a store-wide version counter.
//! The synchronizer mirrors everything above its checkpoint version.
//! Access bookkeeping (`touch`) and importance refreshes do not bump it.

use super::record::{ChunkRef, MemoryKind, MemoryRecord};
use crate::deadline::{self, Deadline};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Marker left behind by `delete` so sync does not resurrect the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: Uuid,
    pub kind: MemoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkRef>,
    pub deleted_at: DateTime<Utc>,
    /// Store version at which the delete happened
    pub version: u64,
}

/// A mutation above some version, as seen by the synchronizer
#[derive(Debug, Clone)]
pub enum Change {
    Upsert { version: u64, record: Arc<MemoryRecord> },
    Delete(Tombstone),
}

impl Change {
    pub fn version(&self) -> u64 {
        match self {
            Change::Upsert { version, .. } => *version,
            Change::Delete(t) => t.version,
        }
    }
}

struct Slot {
    record: Arc<MemoryRecord>,
    version: u64,
    deleted_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn tombstone(&self) -> Option<Tombstone> {
        self.deleted_at.map(|deleted_at| Tombstone {
            id: self.record.id,
            kind: self.record.kind,
            chunk: self.record.chunk.clone(),
            deleted_at,
            version: self.version,
        })
    }
}

/// Predicates for `RecordStore::scan`
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub kinds: Option<Vec<MemoryKind>>,
    pub archived: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub source_doc_id: Option<String>,
}

impl ScanFilter {
    /// Every live (non-deleted) record
    pub fn all() -> Self {
        Self::default()
    }

    /// Records still in the hot set
    pub fn active() -> Self {
        Self {
            archived: Some(false),
            ..Self::default()
        }
    }

    pub fn archived() -> Self {
        Self {
            archived: Some(true),
            ..Self::default()
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn created_between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self.created_before = Some(before);
        self
    }

    pub fn document(mut self, doc_id: impl Into<String>) -> Self {
        self.source_doc_id = Some(doc_id.into());
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&record.kind) {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if record.archived != archived {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        if let Some(doc_id) = &self.source_doc_id {
            if record.chunk.as_ref().map(|c| &c.source_doc_id) != Some(doc_id) {
                return false;
            }
        }
        true
    }
}

/// Lazy, restartable view over a point-in-time snapshot of the store
pub struct Scan {
    snapshot: Arc<Vec<Arc<MemoryRecord>>>,
    filter: ScanFilter,
    position: usize,
    deadline: Option<Deadline>,
    truncated: bool,
}

impl Scan {
    /// Stop yielding once `deadline` passes
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Rewind to the start of the same snapshot
    pub fn restart(&mut self) {
        self.position = 0;
        self.truncated = false;
    }

    /// Whether iteration stopped early on the deadline
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Drain the scan, returning the records and the truncation flag
    pub fn collect_records(mut self) -> (Vec<Arc<MemoryRecord>>, bool) {
        let records: Vec<_> = self.by_ref().collect();
        (records, self.truncated)
    }
}

impl Iterator for Scan {
    type Item = Arc<MemoryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.snapshot.len() {
            if deadline::is_expired(self.deadline.as_ref()) {
                self.truncated = true;
                return None;
            }
            let record = &self.snapshot[self.position];
            self.position += 1;
            if self.filter.matches(record) {
                return Some(record.clone());
            }
        }
        None
    }
}

/// In-memory store for memory records of one partition
pub struct RecordStore {
    partition: String,
    dimension: usize,
    /// Identifies this store instance; checkpoints from other epochs are stale
    epoch: Uuid,
    slots: Arc<RwLock<HashMap<Uuid, Slot>>>,
    version: AtomicU64,
}

impl RecordStore {
    /// Create a new empty store for `partition` holding `dimension`-length embeddings
    pub fn new(partition: impl Into<String>, dimension: usize) -> Self {
        Self {
            partition: partition.into(),
            dimension,
            epoch: Uuid::new_v4(),
            slots: Arc::new(RwLock::new(HashMap::new())),
            version: AtomicU64::new(0),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Current store-wide version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reject records the index could not hold
    pub fn validate(&self, record: &MemoryRecord) -> Result<()> {
        if record.embedding.len() != self.dimension {
            return Err(Error::Validation(format!(
                "embedding dimension {} does not match store dimension {}",
                record.embedding.len(),
                self.dimension
            )));
        }
        if record.content.trim().is_empty() {
            return Err(Error::Validation("record content is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&record.importance) {
            return Err(Error::Validation(format!(
                "importance {} outside [0, 1]",
                record.importance
            )));
        }
        Ok(())
    }

    /// Insert or replace a record by id, returning its new version
    pub async fn put(&self, record: MemoryRecord) -> Result<u64> {
        self.validate(&record)?;
        let id = record.id;
        let mut slots = self.slots.write().await;
        if slots.get(&id).map_or(false, |s| s.deleted_at.is_some()) {
            return Err(Error::Validation(format!("record {} was deleted", id)));
        }
        let version = self.next_version();
        slots.insert(
            id,
            Slot {
                record: Arc::new(record),
                version,
                deleted_at: None,
            },
        );
        Ok(version)
    }

    /// Retrieve a live record by id (archived records included)
    pub async fn get(&self, id: &Uuid) -> Result<MemoryRecord> {
        self.slots
            .read()
            .await
            .get(id)
            .filter(|s| s.deleted_at.is_none())
            .map(|s| s.record.as_ref().clone())
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))
    }

    /// Whether `id` was deleted in this store
    pub async fn is_tombstoned(&self, id: &Uuid) -> bool {
        self.slots
            .read()
            .await
            .get(id)
            .is_some_and(|s| s.deleted_at.is_some())
    }

    /// Snapshot the store and return a lazy scan over matching live records
    pub async fn scan(&self, filter: ScanFilter) -> Scan {
        let snapshot: Vec<Arc<MemoryRecord>> = self
            .slots
            .read()
            .await
            .values()
            .filter(|s| s.deleted_at.is_none())
            .map(|s| s.record.clone())
            .collect();
        Scan {
            snapshot: Arc::new(snapshot),
            filter,
            position: 0,
            deadline: None,
            truncated: false,
        }
    }

    /// Tombstone a record; physical removal happens in compaction
    pub async fn delete(&self, id: &Uuid) -> Result<Tombstone> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(id)
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
        slot.version = self.next_version();
        slot.deleted_at = Some(Utc::now());
        slot.tombstone()
            .ok_or_else(|| Error::Internal("tombstone not recorded".to_string()))
    }

    /// Record a retrieval hit without bumping the version
    pub async fn touch(&self, id: &Uuid, now: DateTime<Utc>) -> Option<MemoryRecord> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(id).filter(|s| s.deleted_at.is_none())?;
        let record = Arc::make_mut(&mut slot.record);
        record.record_access(now);
        Some(record.clone())
    }

    /// Overwrite importance scores without bumping the version
    pub(crate) async fn set_importance(
        &self,
        updates: &[(Uuid, f32)],
        now: DateTime<Utc>,
    ) -> Vec<MemoryRecord> {
        let mut slots = self.slots.write().await;
        let mut changed = Vec::with_capacity(updates.len());
        for (id, importance) in updates {
            if let Some(slot) = slots.get_mut(id).filter(|s| s.deleted_at.is_none()) {
                let record = Arc::make_mut(&mut slot.record);
                record.importance = importance.clamp(0.0, 1.0);
                record.importance_scored_at = now;
                changed.push(record.clone());
            }
        }
        changed
    }

    /// Mark active records archived, returning the ids that changed state
    pub(crate) async fn archive(&self, ids: &[Uuid]) -> Vec<Uuid> {
        let mut slots = self.slots.write().await;
        let mut archived = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(slot) = slots.get_mut(id) {
                if slot.deleted_at.is_some() || slot.record.archived {
                    continue;
                }
                Arc::make_mut(&mut slot.record).archived = true;
                slot.version = self.next_version();
                archived.push(*id);
            }
        }
        archived
    }

    /// Physically drop tombstones older than `grace`, returning them
    pub(crate) async fn purge_tombstones(&self, grace: Duration, now: DateTime<Utc>) -> Vec<Tombstone> {
        let mut slots = self.slots.write().await;
        let expired: Vec<Uuid> = slots
            .iter()
            .filter(|(_, s)| s.deleted_at.map_or(false, |at| at + grace <= now))
            .map(|(id, _)| *id)
            .collect();
        expired
            .iter()
            .filter_map(|id| slots.remove(id))
            .filter_map(|s| s.tombstone())
            .collect()
    }

    /// Undo a `put` whose index insertion failed
    pub(crate) async fn remove_hard(&self, id: &Uuid) -> bool {
        self.slots.write().await.remove(id).is_some()
    }

    /// Every mutation with a version above `version`, oldest first
    pub async fn changes_since(&self, version: u64) -> Vec<Change> {
        let slots = self.slots.read().await;
        let mut changes: Vec<Change> = slots
            .values()
            .filter(|s| s.version > version)
            .map(|s| match s.tombstone() {
                Some(t) => Change::Delete(t),
                None => Change::Upsert {
                    version: s.version,
                    record: s.record.clone(),
                },
            })
            .collect();
        changes.sort_by_key(Change::version);
        changes
    }

    /// Drop every slot (restore rebuilds from scratch). The version keeps counting.
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    /// Non-archived, non-deleted records
    pub async fn active_len(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.deleted_at.is_none() && !s.record.archived)
            .count()
    }

    /// Counts of (active, archived, tombstoned) slots
    pub async fn counts(&self) -> StoreCounts {
        let slots = self.slots.read().await;
        let mut counts = StoreCounts::default();
        for slot in slots.values() {
            if slot.deleted_at.is_some() {
                counts.tombstoned += 1;
            } else if slot.record.archived {
                counts.archived += 1;
            } else {
                counts.active += 1;
            }
        }
        counts
    }
}

/// Slot counts by lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub active: usize,
    pub archived: usize,
    pub tombstoned: usize,
}
