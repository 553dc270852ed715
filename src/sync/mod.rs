//! Tiered storage synchronizer
//!
//! Mirrors the hot store into cold storage and rebuilds it from there.
//!
//! Cold layout, per partition:
//!
//! ```text
//! {partition}/memories/{kind}/{id}             record or tombstone
//! {partition}/documents/{doc_id}/{offset}      chunk record or tombstone
//! {partition}/indexes/checkpoint.json          SyncCheckpoint (plain JSON)
//! {partition}/indexes/chunks/{id}              key of a chunk's document object
//! {partition}/backups/{snapshot_id}.json.gz    full snapshot
//! ```
//!
//! `sync` is incremental: it mirrors every store change above the
//! checkpoint version and only then advances the checkpoint. A crash or a
//! failed write leaves the checkpoint at the last acknowledged change, and
//! rewriting an object with identical content is a no-op, so re-running a
//! sync is always safe.

pub mod backend;
pub mod codec;
pub mod retry;

pub use backend::{ColdStorage, FsColdStorage, MemoryColdStorage};
pub use codec::{ColdObject, ObjectCodec};
pub use retry::RetryPolicy;

use crate::config::SyncConfig;
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use crate::index::EmbeddingIndex;
use crate::memory::{Change, MemoryKind, MemoryRecord, RecordStore, ScanFilter, Tombstone};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Progress marker of the mirror for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub partition: String,
    /// Incremented every time the checkpoint advances
    pub sequence: u64,
    /// Highest store version known to be mirrored
    pub last_version: u64,
    /// Store instance `last_version` refers to
    #[serde(default)]
    pub store_epoch: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    fn empty(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
            sequence: 0,
            last_version: 0,
            store_epoch: None,
            updated_at: Utc::now(),
        }
    }
}

/// Result of one `sync`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Objects written to cold storage
    pub synced_count: usize,
    /// Changes left unmirrored because of a failure
    pub failed_count: usize,
    /// Cold storage could not be reached within the retry budget
    pub degraded: bool,
    pub tombstones_written: usize,
    /// Objects skipped because cold storage already holds that content
    pub unchanged_count: usize,
    pub cancelled: bool,
    pub checkpoint_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a `restore` or `restore_snapshot`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub partition: String,
    /// Active records loaded into the hot tier
    pub restored_count: usize,
    /// Objects that were unreadable, corrupt or rejected
    pub skipped_count: usize,
    pub skipped_keys: Vec<String>,
    /// Archived records left in cold storage
    pub archived_count: usize,
    pub tombstone_count: usize,
    pub cancelled: bool,
}

/// Result of `backup_full`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub snapshot_id: String,
    pub key: String,
    /// Records captured in the snapshot
    pub record_count: usize,
    /// Mirror objects written while refreshing the incremental layout
    pub mirrored_count: usize,
}

/// Self-contained copy of a partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub partition: String,
    pub created_at: DateTime<Utc>,
    pub store_version: u64,
    pub records: Vec<MemoryRecord>,
}

/// Health of the mirror, for `stats`
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub backend: String,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub checkpoint: SyncCheckpoint,
    pub pending_tombstones: usize,
    pub encrypted: bool,
}

struct SyncState {
    checkpoint: SyncCheckpoint,
    checkpoint_loaded: bool,
    degraded: bool,
    last_error: Option<String>,
    last_sync_at: Option<DateTime<Utc>>,
    pending_tombstones: Vec<Tombstone>,
    /// Digest of the last object written under each key by this process
    digests: HashMap<String, [u8; 32]>,
}

pub fn memories_prefix(partition: &str) -> String {
    format!("{}/memories/", partition)
}

pub fn documents_prefix(partition: &str) -> String {
    format!("{}/documents/", partition)
}

pub fn backups_prefix(partition: &str) -> String {
    format!("{}/backups/", partition)
}

pub fn checkpoint_key(partition: &str) -> String {
    format!("{}/indexes/checkpoint.json", partition)
}

/// Pointer from a chunk id to its `documents/` key
pub fn chunk_pointer_key(partition: &str, id: &Uuid) -> String {
    format!("{}/indexes/chunks/{}", partition, id)
}

pub fn snapshot_key(partition: &str, snapshot_id: &str) -> String {
    format!("{}{}.json.gz", backups_prefix(partition), snapshot_id)
}

/// Mirror key of a record or of its tombstone
pub fn object_key(
    partition: &str,
    kind: MemoryKind,
    id: &Uuid,
    chunk: Option<&crate::memory::ChunkRef>,
) -> String {
    match chunk {
        Some(chunk) => format!(
            "{}{}/{}",
            documents_prefix(partition),
            chunk.source_doc_id,
            chunk.chunk_offset
        ),
        None => format!("{}{}/{}", memories_prefix(partition), kind, id),
    }
}

fn change_object(partition: &str, change: &Change) -> (String, ColdObject) {
    match change {
        Change::Upsert { record, .. } => (
            object_key(partition, record.kind, &record.id, record.chunk.as_ref()),
            ColdObject::Record {
                record: record.as_ref().clone(),
            },
        ),
        Change::Delete(tombstone) => tombstone_object(partition, tombstone),
    }
}

fn tombstone_object(partition: &str, tombstone: &Tombstone) -> (String, ColdObject) {
    (
        object_key(partition, tombstone.kind, &tombstone.id, tombstone.chunk.as_ref()),
        ColdObject::Tombstone {
            tombstone: tombstone.clone(),
        },
    )
}

fn check_partition(partition: &str) -> Result<()> {
    if partition.is_empty() || partition.contains('/') || partition == "." || partition == ".." {
        return Err(Error::Restore(format!("invalid partition '{}'", partition)));
    }
    Ok(())
}

/// Mirrors one partition's hot store into cold storage
pub struct Synchronizer {
    store: Arc<RecordStore>,
    index: Arc<EmbeddingIndex>,
    cold: Arc<dyn ColdStorage>,
    codec: ObjectCodec,
    master_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    retry: RetryPolicy,
    restore_concurrency: usize,
    /// Serializes sync, restore and backup
    run_lock: Mutex<()>,
    state: RwLock<SyncState>,
}

impl Synchronizer {
    pub fn new(
        config: &SyncConfig,
        store: Arc<RecordStore>,
        index: Arc<EmbeddingIndex>,
        cold: Arc<dyn ColdStorage>,
    ) -> Result<Self> {
        let partition = store.partition().to_string();
        Ok(Self {
            codec: ObjectCodec::from_config(config, &partition)?,
            master_key: config.master_key()?,
            retry: RetryPolicy::from_config(config),
            restore_concurrency: config.restore_concurrency.max(1),
            run_lock: Mutex::new(()),
            state: RwLock::new(SyncState {
                checkpoint: SyncCheckpoint::empty(&partition),
                checkpoint_loaded: false,
                degraded: false,
                last_error: None,
                last_sync_at: None,
                pending_tombstones: Vec::new(),
                digests: HashMap::new(),
            }),
            store,
            index,
            cold,
        })
    }

    /// Replace the retry policy (tests use `RetryPolicy::immediate`)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn partition(&self) -> &str {
        self.store.partition()
    }

    pub fn cold(&self) -> &Arc<dyn ColdStorage> {
        &self.cold
    }

    fn codec_for(&self, partition: &str) -> Result<Option<ObjectCodec>> {
        if partition == self.partition() {
            return Ok(None);
        }
        Ok(Some(match &self.master_key {
            Some(master) => ObjectCodec::encrypted(master, partition)?,
            None => ObjectCodec::plain(),
        }))
    }

    /// Queue tombstones whose slots were purged before they were mirrored
    pub async fn enqueue_tombstones(&self, tombstones: Vec<Tombstone>) {
        if tombstones.is_empty() {
            return;
        }
        self.state.write().await.pending_tombstones.extend(tombstones);
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.read().await;
        SyncStatus {
            backend: self.cold.name().to_string(),
            degraded: state.degraded,
            last_error: state.last_error.clone(),
            last_sync_at: state.last_sync_at,
            checkpoint: state.checkpoint.clone(),
            pending_tombstones: state.pending_tombstones.len(),
            encrypted: self.codec.is_encrypted(),
        }
    }

    /// Store versions not yet mirrored, plus queued tombstones
    pub async fn lag(&self) -> u64 {
        let state = self.state.read().await;
        let mirrored = if state.checkpoint.store_epoch == Some(self.store.epoch()) {
            state.checkpoint.last_version
        } else {
            0
        };
        self.store.version().saturating_sub(mirrored) + state.pending_tombstones.len() as u64
    }

    async fn mark_degraded(&self, error: &Error) {
        let mut state = self.state.write().await;
        state.degraded = true;
        state.last_error = Some(error.to_string());
    }

    async fn ensure_checkpoint(&self, cancel: &CancellationToken) -> Result<SyncCheckpoint> {
        {
            let state = self.state.read().await;
            if state.checkpoint_loaded {
                return Ok(state.checkpoint.clone());
            }
        }
        let key = checkpoint_key(self.partition());
        let bytes = self
            .retry
            .run("load checkpoint", cancel, || self.cold.get(&key))
            .await?;
        let checkpoint = match bytes {
            Some(bytes) => match serde_json::from_slice::<SyncCheckpoint>(&bytes) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable checkpoint, starting over");
                    SyncCheckpoint::empty(self.partition())
                }
            },
            None => SyncCheckpoint::empty(self.partition()),
        };
        let mut state = self.state.write().await;
        state.checkpoint = checkpoint.clone();
        state.checkpoint_loaded = true;
        Ok(checkpoint)
    }

    async fn write_checkpoint(
        &self,
        checkpoint: SyncCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = checkpoint_key(&checkpoint.partition);
        let bytes = Bytes::from(serde_json::to_vec_pretty(&checkpoint)?);
        self.retry
            .run("write checkpoint", cancel, || self.cold.put(&key, bytes.clone()))
            .await?;
        let mut state = self.state.write().await;
        state.checkpoint = checkpoint;
        state.checkpoint_loaded = true;
        Ok(())
    }

    /// Write one object unless this process already wrote the same content there
    async fn write_object(
        &self,
        key: &str,
        object: &ColdObject,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let digest = codec::digest(object)?;
        if self.state.read().await.digests.get(key) == Some(&digest) {
            return Ok(false);
        }
        let bytes = self.codec.encode(object)?;
        self.retry
            .run("write object", cancel, || self.cold.put(key, bytes.clone()))
            .await?;
        if let ColdObject::Record { record } = object {
            if record.chunk.is_some() {
                let pointer = chunk_pointer_key(self.partition(), &record.id);
                let target = self.codec.encode(&key)?;
                self.retry
                    .run("write chunk pointer", cancel, || {
                        self.cold.put(&pointer, target.clone())
                    })
                    .await?;
            }
        }
        self.state
            .write()
            .await
            .digests
            .insert(key.to_string(), digest);
        Ok(true)
    }

    /// Mirror every change above the checkpoint, then advance it.
    ///
    /// Never fails: unreachable storage is reported through `degraded`.
    pub async fn sync(&self, cancel: &CancellationToken) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let mut report = SyncReport::default();
        let partition = self.partition().to_string();

        let checkpoint = match self.ensure_checkpoint(cancel).await {
            Ok(checkpoint) => checkpoint,
            Err(Error::Cancelled) => {
                report.cancelled = true;
                return report;
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Cold storage unreachable, sync degraded");
                self.mark_degraded(&e).await;
                report.degraded = true;
                report.failed_count = self.store.changes_since(0).await.len();
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.checkpoint_sequence = checkpoint.sequence;

        let epoch = self.store.epoch();
        let since = if checkpoint.store_epoch == Some(epoch) {
            checkpoint.last_version
        } else {
            if checkpoint.store_epoch.is_some() {
                info!(partition = %partition, "Checkpoint belongs to another store epoch, full resync");
            }
            0
        };

        let pending = std::mem::take(&mut self.state.write().await.pending_tombstones);
        let mut failure: Option<Error> = None;
        let mut unsent = Vec::new();
        for tombstone in pending {
            if failure.is_some() || cancel.is_cancelled() {
                unsent.push(tombstone);
                continue;
            }
            let (key, object) = tombstone_object(&partition, &tombstone);
            match self.write_object(&key, &object, cancel).await {
                Ok(_) => report.tombstones_written += 1,
                Err(e) => {
                    unsent.push(tombstone);
                    failure = Some(e);
                }
            }
        }
        if !unsent.is_empty() {
            self.state.write().await.pending_tombstones.extend(unsent);
        }

        let changes = self.store.changes_since(since).await;
        let mut acked = since;
        if failure.is_none() {
            for (i, change) in changes.iter().enumerate() {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let (key, object) = change_object(&partition, change);
                match self.write_object(&key, &object, cancel).await {
                    Ok(true) => report.synced_count += 1,
                    Ok(false) => report.unchanged_count += 1,
                    Err(e) => {
                        report.failed_count = changes.len() - i;
                        failure = Some(e);
                        break;
                    }
                }
                if matches!(change, Change::Delete(_)) {
                    report.tombstones_written += 1;
                }
                acked = change.version();
            }
        } else {
            report.failed_count = changes.len();
        }

        match failure {
            Some(Error::Cancelled) => report.cancelled = true,
            Some(e) => {
                warn!(
                    partition = %partition,
                    failed = report.failed_count,
                    error = %e,
                    "Sync degraded, hot tier continues"
                );
                self.mark_degraded(&e).await;
                report.degraded = true;
                report.error = Some(e.to_string());
            }
            None => {}
        }

        let advanced = acked > since;
        let adopt_epoch = checkpoint.store_epoch != Some(epoch)
            && report.failed_count == 0
            && !report.degraded
            && !report.cancelled;
        if advanced || adopt_epoch {
            let next = SyncCheckpoint {
                partition: partition.clone(),
                sequence: checkpoint.sequence + 1,
                last_version: acked,
                store_epoch: Some(epoch),
                updated_at: Utc::now(),
            };
            // A cancelled write leaves the previous checkpoint in place
            match self.write_checkpoint(next, &CancellationToken::new()).await {
                Ok(()) => report.checkpoint_sequence = checkpoint.sequence + 1,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Checkpoint write failed");
                    self.mark_degraded(&e).await;
                    report.degraded = true;
                    report.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if !report.degraded && !report.cancelled {
            let mut state = self.state.write().await;
            state.degraded = false;
            state.last_error = None;
            state.last_sync_at = Some(Utc::now());
        }
        if report.synced_count > 0 || report.degraded {
            info!(
                partition = %partition,
                synced = report.synced_count,
                failed = report.failed_count,
                tombstones = report.tombstones_written,
                degraded = report.degraded,
                "Sync finished"
            );
        } else {
            debug!(partition = %partition, "Sync found nothing to mirror");
        }
        report
    }

    async fn fetch_object(
        &self,
        codec: &ObjectCodec,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ColdObject> {
        let bytes = self
            .retry
            .run("read object", cancel, || self.cold.get(key))
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        codec.decode(&bytes)
    }

    async fn list_with_retry(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.retry
            .run("list objects", cancel, || self.cold.list(prefix))
            .await
    }

    /// Insert a cold record into the hot tier; only active records are indexed.
    ///
    /// Returns whether the record is archived.
    async fn rehydrate(&self, record: MemoryRecord) -> Result<bool> {
        let id = record.id;
        let archived = record.archived;
        self.store.put(record.clone()).await?;
        if archived {
            return Ok(true);
        }
        if let Err(e) = self.index.index(&record).await {
            self.store.remove_hard(&id).await;
            return Err(e);
        }
        Ok(false)
    }

    /// Rebuild the hot tier from the mirror of `partition`.
    ///
    /// Unreadable objects are skipped and listed in the report. Only a
    /// failure to list the partition at all is an error.
    pub async fn restore(&self, partition: &str, cancel: &CancellationToken) -> Result<RestoreReport> {
        check_partition(partition)?;
        let _guard = self.run_lock.lock().await;
        let other = self.codec_for(partition)?;
        let codec = other.as_ref().unwrap_or(&self.codec);
        if other.is_none() {
            // Keeps the checkpoint sequence monotonic across processes
            if let Err(e) = self.ensure_checkpoint(cancel).await {
                warn!(partition = %partition, error = %e, "Could not load checkpoint before restore");
            }
        }

        let mut keys = Vec::new();
        for prefix in [memories_prefix(partition), documents_prefix(partition)] {
            let listed = self.list_with_retry(&prefix, cancel).await.map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                e => Error::Restore(format!("cannot list {}: {}", prefix, e)),
            })?;
            keys.extend(listed);
        }

        info!(partition = %partition, objects = keys.len(), "Restoring partition");
        self.store.clear().await;
        self.index.clear().await;

        let mut report = RestoreReport {
            partition: partition.to_string(),
            ..Default::default()
        };
        let mut fetches = stream::iter(keys)
            .map(|key| async move {
                let result = self.fetch_object(codec, &key, cancel).await;
                (key, result)
            })
            .buffer_unordered(self.restore_concurrency);

        while let Some((key, result)) = fetches.next().await {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match result {
                Ok(ColdObject::Record { record }) => match self.rehydrate(record).await {
                    Ok(true) => report.archived_count += 1,
                    Ok(false) => report.restored_count += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Rejected restored record");
                        report.skipped_count += 1;
                        report.skipped_keys.push(key);
                    }
                },
                Ok(ColdObject::Tombstone { .. }) => report.tombstone_count += 1,
                Err(Error::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable object");
                    report.skipped_count += 1;
                    report.skipped_keys.push(key);
                }
            }
        }
        drop(fetches);

        self.finish_restore(partition, report.cancelled).await;
        info!(
            partition = %partition,
            restored = report.restored_count,
            skipped = report.skipped_count,
            archived = report.archived_count,
            tombstones = report.tombstone_count,
            cancelled = report.cancelled,
            "Restore finished"
        );
        Ok(report)
    }

    /// Point the checkpoint at the freshly restored store
    async fn finish_restore(&self, partition: &str, cancelled: bool) {
        let own = partition == self.partition();
        let mut state = self.state.write().await;
        state.digests.clear();
        if cancelled || !own || !state.checkpoint_loaded {
            // Everything in the hot tier still has to reach our own mirror.
            // An unloaded checkpoint is left for the next sync to read.
            state.checkpoint.last_version = 0;
            state.checkpoint.store_epoch = None;
            if own && !cancelled && !state.checkpoint_loaded {
                warn!(partition = %partition, "Restore checkpoint not written, remote checkpoint never loaded");
            }
            return;
        }
        let checkpoint = SyncCheckpoint {
            partition: partition.to_string(),
            sequence: state.checkpoint.sequence + 1,
            last_version: self.store.version(),
            store_epoch: Some(self.store.epoch()),
            updated_at: Utc::now(),
        };
        state.checkpoint = checkpoint.clone();
        state.checkpoint_loaded = true;
        drop(state);
        if let Err(e) = self.write_checkpoint(checkpoint, &CancellationToken::new()).await {
            warn!(partition = %partition, error = %e, "Could not persist restore checkpoint");
        }
    }

    /// Write a self-contained snapshot and refresh every mirror object.
    ///
    /// Independent of the incremental checkpoint.
    pub async fn backup_full(&self, cancel: &CancellationToken) -> Result<BackupReport> {
        let _guard = self.run_lock.lock().await;
        let partition = self.partition().to_string();
        let store_version = self.store.version();
        let (records, _) = self.store.scan(ScanFilter::all()).await.collect_records();

        let mut mirrored = 0;
        for record in &records {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let key = object_key(&partition, record.kind, &record.id, record.chunk.as_ref());
            let object = ColdObject::Record {
                record: record.as_ref().clone(),
            };
            match self.write_object(&key, &object, cancel).await {
                Ok(true) => mirrored += 1,
                Ok(false) => {}
                Err(e) => {
                    self.mark_degraded(&e).await;
                    return Err(Error::SyncDegraded(format!("backup of {}: {}", key, e)));
                }
            }
        }

        let now = Utc::now();
        let snapshot_id = format!(
            "{}-{}",
            now.format("%Y%m%dT%H%M%S%.3fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            partition: partition.clone(),
            created_at: now,
            store_version,
            records: records.iter().map(|r| r.as_ref().clone()).collect(),
        };
        let key = snapshot_key(&partition, &snapshot_id);
        let bytes = self.codec.encode(&snapshot)?;
        if let Err(e) = self
            .retry
            .run("write snapshot", cancel, || self.cold.put(&key, bytes.clone()))
            .await
        {
            self.mark_degraded(&e).await;
            return Err(match e {
                Error::Cancelled => Error::Cancelled,
                e => Error::SyncDegraded(format!("snapshot {}: {}", key, e)),
            });
        }

        info!(
            partition = %partition,
            snapshot = %snapshot_id,
            records = snapshot.records.len(),
            mirrored,
            "Full backup written"
        );
        Ok(BackupReport {
            snapshot_id,
            key,
            record_count: snapshot.records.len(),
            mirrored_count: mirrored,
        })
    }

    /// Snapshot ids of `partition`, oldest first
    pub async fn list_snapshots(&self, partition: &str) -> Result<Vec<String>> {
        check_partition(partition)?;
        let prefix = backups_prefix(partition);
        let keys = self.list_with_retry(&prefix, &CancellationToken::new()).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.strip_suffix(".json.gz"))
            .map(str::to_string)
            .collect())
    }

    /// Replace the hot tier with the contents of one snapshot
    pub async fn restore_snapshot(
        &self,
        partition: &str,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        check_partition(partition)?;
        if snapshot_id.is_empty() || snapshot_id.contains('/') {
            return Err(Error::Validation(format!("invalid snapshot id '{}'", snapshot_id)));
        }
        let _guard = self.run_lock.lock().await;
        let other = self.codec_for(partition)?;
        let codec = other.as_ref().unwrap_or(&self.codec);

        let key = snapshot_key(partition, snapshot_id);
        let bytes = self
            .retry
            .run("read snapshot", cancel, || self.cold.get(&key))
            .await?
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", snapshot_id)))?;
        let snapshot: Snapshot = codec
            .decode(&bytes)
            .map_err(|e| Error::Restore(format!("snapshot {}: {}", snapshot_id, e)))?;

        self.store.clear().await;
        self.index.clear().await;
        let mut report = RestoreReport {
            partition: partition.to_string(),
            ..Default::default()
        };
        for record in snapshot.records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let id = record.id;
            match self.rehydrate(record).await {
                Ok(true) => report.archived_count += 1,
                Ok(false) => report.restored_count += 1,
                Err(e) => {
                    warn!(snapshot = %snapshot_id, record = %id, error = %e, "Rejected snapshot record");
                    report.skipped_count += 1;
                    report.skipped_keys.push(format!("{}#{}", key, id));
                }
            }
        }

        // Snapshot contents may predate the mirror; resync from scratch
        {
            let mut state = self.state.write().await;
            state.digests.clear();
            state.checkpoint.last_version = 0;
            state.checkpoint.store_epoch = None;
        }
        info!(
            partition = %partition,
            snapshot = %snapshot_id,
            restored = report.restored_count,
            "Snapshot restored"
        );
        Ok(report)
    }

    /// Look up a record in this partition's mirror by id.
    ///
    /// Records whose deletion is still queued for the mirror are treated as gone.
    pub async fn fetch_cold(&self, id: &Uuid) -> Result<Option<MemoryRecord>> {
        if self
            .state
            .read()
            .await
            .pending_tombstones
            .iter()
            .any(|t| &t.id == id)
        {
            return Ok(None);
        }
        let cancel = CancellationToken::new();
        for kind in MemoryKind::ALL {
            let key = object_key(self.partition(), kind, id, None);
            match self.fetch_object(&self.codec, &key, &cancel).await {
                Ok(ColdObject::Record { record }) => return Ok(Some(record)),
                Ok(ColdObject::Tombstone { .. }) => return Ok(None),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        // Chunks live under their document; follow the pointer written with them
        let pointer = chunk_pointer_key(self.partition(), id);
        let bytes = self
            .retry
            .run("read chunk pointer", &cancel, || self.cold.get(&pointer))
            .await?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let key: String = self.codec.decode(&bytes)?;
        match self.fetch_object(&self.codec, &key, &cancel).await {
            Ok(ColdObject::Record { record }) if &record.id == id => Ok(Some(record)),
            Ok(_) | Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
