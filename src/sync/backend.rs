//! Cold storage backends
//!
//! A key-value object store addressed by `/`-separated keys. Two backends
//! ship with the crate:
//!
//! - `FsColdStorage` keeps one file per object under `{base_dir}/{bucket}`.
//!   Writes go to a temporary file and are renamed into place, so a reader
//!   never sees a half-written object.
//! - `MemoryColdStorage` keeps every version of every object in process
//!   memory and can inject failures, which makes it the backend of choice
//!   for tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Durable object store used as the cold tier
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous object
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()>;

    /// Read the latest object under `key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Every key starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn name(&self) -> &str;
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(Error::Validation(format!("invalid object key '{}'", key)));
    }
    Ok(())
}

/// Filesystem-backed cold storage
#[derive(Debug, Clone)]
pub struct FsColdStorage {
    root: PathBuf,
}

impl FsColdStorage {
    pub fn new(base_dir: impl AsRef<Path>, bucket: &str) -> Result<Self> {
        check_key(bucket)?;
        Ok(Self {
            root: base_dir.as_ref().join(bucket),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, part| p.join(part)))
    }
}

fn io_to_storage(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => Error::Storage(e.to_string()),
        _ => Error::Io(e),
    }
}

#[async_trait]
impl ColdStorage for FsColdStorage {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_to_storage)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_to_storage)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_to_storage(e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_to_storage(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_to_storage(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_to_storage)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.contains(".tmp-") {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                if entry.file_type().await.map_err(io_to_storage)?.is_dir() {
                    // Descend only into directories that can still match
                    if prefix.starts_with(&key) || key.starts_with(prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "fs"
    }
}

/// In-memory versioned cold storage with fault injection
#[derive(Debug, Default)]
pub struct MemoryColdStorage {
    objects: RwLock<BTreeMap<String, Vec<Bytes>>>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    puts: AtomicUsize,
}

impl MemoryColdStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageUnavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `StorageUnavailable`
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Overwrite the latest version of `key` with garbage
    pub async fn corrupt(&self, key: &str) {
        if let Some(versions) = self.objects.write().await.get_mut(key) {
            versions.push(Bytes::from_static(b"\x00not an object"));
        }
    }

    /// Number of stored versions of `key`
    pub async fn versions(&self, key: &str) -> usize {
        self.objects.read().await.get(key).map_or(0, Vec::len)
    }

    /// Physical writes performed (no-op puts excluded)
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("cold storage offline".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(Error::StorageUnavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ColdStorage for MemoryColdStorage {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        check_key(key)?;
        self.check_available()?;
        let mut objects = self.objects.write().await;
        let versions = objects.entry(key.to_string()).or_default();
        if versions.last() != Some(&bytes) {
            versions.push(bytes);
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        check_key(key)?;
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .and_then(|v| v.last().cloned()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
