//! Embedding index for similarity search over the hot set
//!
//! A flat cosine index: vectors are L2-normalised once on insert, so a
//! search is one dot product per entry. Entries are swapped in whole under
//! the write lock, so concurrent readers never see a half-written vector.
//!
//! Each entry caches the record's kind, importance and last access so the
//! index can filter by kind and break similarity ties without touching the
//! record store.

use crate::deadline::{self, Deadline};
use crate::error::{Error, Result};
use crate::memory::{MemoryKind, MemoryRecord};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Deadline is checked once per this many entries
const DEADLINE_STRIDE: usize = 256;

#[derive(Debug, Clone)]
struct IndexEntry {
    vector: Arc<[f32]>,
    kind: MemoryKind,
    importance: f32,
    last_accessed_at: Option<DateTime<Utc>>,
}

/// One search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: Uuid,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
    pub importance: f32,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Search results plus whether the deadline cut the scan short
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub truncated: bool,
}

/// Cosine similarity index over non-archived records
pub struct EmbeddingIndex {
    dimension: usize,
    entries: RwLock<HashMap<Uuid, IndexEntry>>,
    generation: AtomicU64,
}

impl EmbeddingIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Bumped every time the index is rebuilt from scratch
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    /// Fail with `DimensionMismatch` unless `len` matches the index
    pub fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: len,
            });
        }
        Ok(())
    }

    /// Insert or replace the vector of an active record
    pub async fn index(&self, record: &MemoryRecord) -> Result<()> {
        self.check_dimension(record.embedding.len())?;
        if record.archived {
            return Err(Error::Validation(format!(
                "record {} is archived and cannot be indexed",
                record.id
            )));
        }
        let entry = IndexEntry {
            vector: normalize(&record.embedding).into(),
            kind: record.kind,
            importance: record.importance,
            last_accessed_at: record.last_accessed_at,
        };
        self.entries.write().await.insert(record.id, entry);
        Ok(())
    }

    /// Refresh the ranking metadata cached for a record
    pub async fn update_meta(&self, record: &MemoryRecord) {
        if let Some(entry) = self.entries.write().await.get_mut(&record.id) {
            entry.importance = record.importance;
            entry.last_accessed_at = record.last_accessed_at;
        }
    }

    /// Remove a vector, returning whether it was present
    pub async fn remove(&self, id: &Uuid) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Remove several vectors under one lock acquisition
    pub async fn remove_many(&self, ids: &[Uuid]) -> usize {
        let mut entries = self.entries.write().await;
        ids.iter().filter(|id| entries.remove(id).is_some()).count()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every vector and start a new generation
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Up to `k` entries with similarity ≥ `floor`, best first.
    ///
    /// Ties are broken by higher importance, then by the most recent access.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        floor: f32,
        kinds: Option<&[MemoryKind]>,
        deadline: Option<&Deadline>,
    ) -> Result<SearchOutcome> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(SearchOutcome::default());
        }
        let query = normalize(query);
        if query.iter().all(|x| *x == 0.0) {
            return Ok(SearchOutcome::default());
        }

        let entries = self.entries.read().await;
        let mut hits = Vec::new();
        let mut truncated = false;
        for (n, (id, entry)) in entries.iter().enumerate() {
            if n % DEADLINE_STRIDE == 0 && deadline::is_expired(deadline) {
                truncated = true;
                break;
            }
            if let Some(kinds) = kinds {
                if !kinds.contains(&entry.kind) {
                    continue;
                }
            }
            let similarity = dot(&query, &entry.vector);
            if similarity >= floor {
                hits.push(SearchHit {
                    id: *id,
                    similarity,
                    importance: entry.importance,
                    last_accessed_at: entry.last_accessed_at,
                });
            }
        }
        drop(entries);

        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(SearchOutcome { hits, truncated })
    }
}

fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
}

/// L2-normalise; a zero vector stays zero
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(&normalize(a), &normalize(b))
}
