//! Disk tier: content-addressed blob files with a persistent metadata table
//!
//! Blobs live at `cache_dir/<digest>` and are described by one
//! [`CacheRecord`] each in `cache_dir/metadata.json`. Both must be present
//! for an entry to exist; either one missing makes the entry absent.
//!
//! All operations on a `DiskCache` are serialized through a single async
//! mutex guarding the in-memory copy of the metadata table. Writes, removals
//! and clears run on spawned tasks so that a caller dropping its future does
//! not abandon them halfway.
//!
//! The total size of all records is bounded by a quota. When it is exceeded,
//! entries are evicted oldest-first by file modification time. Reads do not
//! touch modification times, so this is write-recency eviction, an
//! approximation of LRU rather than the real thing.

use crate::error::Result;
use crate::key::digest;
use crate::metadata::{MetadataStore, RecordTable, METADATA_FILE};
use crate::types::{expiry_from_ttl, CacheRecord};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A blob read back from disk along with its expiry
#[derive(Debug, Clone)]
pub(crate) struct DiskHit {
    pub data: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct DiskState {
    records: RecordTable,
    /// Set by every write; cleared once the quota has been checked
    quota_pending: bool,
}

struct DiskInner {
    cache_dir: PathBuf,
    quota: u64,
    metadata: MetadataStore,
    state: Mutex<DiskState>,
    startup: Mutex<Option<JoinHandle<()>>>,
}

/// Quota-bounded blob storage under a single directory
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<DiskInner>,
}

impl DiskCache {
    /// Open (or create) a disk cache rooted at `cache_dir`
    ///
    /// Expired and orphaned entries left over from a previous process are
    /// purged in the background, so they may still be visible on disk for
    /// a short while after this returns.
    pub async fn open(cache_dir: PathBuf, quota: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir).await?;
        let metadata = MetadataStore::new(&cache_dir);
        let records = metadata.load().await?;

        info!(
            cache_dir = ?cache_dir,
            records = records.len(),
            quota,
            "Disk cache initialized"
        );

        let cache = Self {
            inner: Arc::new(DiskInner {
                cache_dir,
                quota,
                metadata,
                state: Mutex::new(DiskState {
                    records,
                    quota_pending: false,
                }),
                startup: Mutex::new(None),
            }),
        };

        let startup = cache.clone();
        let handle = tokio::spawn(async move {
            startup.purge_expired().await;
        });
        *cache.inner.startup.lock().await = Some(handle);

        Ok(cache)
    }

    /// Wait for the startup purge started by [`DiskCache::open`]
    pub async fn ready(&self) {
        let mut startup = self.inner.startup.lock().await;
        if let Some(handle) = startup.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Startup purge failed");
            }
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    pub fn quota(&self) -> u64 {
        self.inner.quota
    }

    /// Read the blob stored under `key`
    pub async fn get_data(&self, key: &str) -> Option<Vec<u8>> {
        self.lookup(key).await.map(|hit| hit.data)
    }

    pub(crate) async fn lookup(&self, key: &str) -> Option<DiskHit> {
        let digest = digest(key);
        let mut state = self.inner.state.lock().await;

        let record = state.records.get(&digest)?.clone();
        if record.key != key {
            warn!(key, other = %record.key, digest = %digest, "Cache key digest collision");
            return None;
        }

        if record.is_expired_at(Utc::now()) {
            debug!(key, digest = %digest, "Disk cache entry expired");
            self.inner.delete_locked(&mut state, &digest).await;
            return None;
        }

        match fs::read(self.inner.blob_path(&digest)).await {
            Ok(data) => {
                debug!(key, size = data.len(), "Disk cache hit");
                Some(DiskHit {
                    data,
                    expires_at: record.expires_at,
                })
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(key, error = %e, "Failed to read cached blob, removing entry");
                }
                self.inner.delete_locked(&mut state, &digest).await;
                None
            }
        }
    }

    /// Store `data` under `key`, replacing any previous blob for it
    ///
    /// `ttl` of `None` means the entry only leaves by eviction or removal.
    pub async fn set_data(&self, data: Vec<u8>, key: &str, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(expiry_from_ttl);
        self.store(data, key, expires_at).await;
    }

    pub(crate) async fn store(&self, data: Vec<u8>, key: &str, expires_at: Option<DateTime<Utc>>) {
        let cache = self.clone();
        let key = key.to_string();
        run_detached(async move {
            match cache.inner.write(&key, &data, expires_at).await {
                Ok(()) => {
                    let checker = cache.clone();
                    tokio::spawn(async move {
                        checker.settle().await;
                    });
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to write cached blob"),
            }
        })
        .await;
    }

    /// Remove the blob stored under `key`, if any
    pub async fn remove_data(&self, key: &str) {
        let cache = self.clone();
        let digest = digest(key);
        run_detached(async move {
            let mut state = cache.inner.state.lock().await;
            cache.inner.delete_locked(&mut state, &digest).await;
        })
        .await;
    }

    /// Delete every blob and the metadata table, leaving an empty directory
    pub async fn clear_all(&self) {
        let cache = self.clone();
        run_detached(async move {
            let inner = &cache.inner;
            let mut state = inner.state.lock().await;

            match fs::remove_dir_all(&inner.cache_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(cache_dir = ?inner.cache_dir, error = %e, "Failed to remove cache directory"),
            }
            if let Err(e) = fs::create_dir_all(&inner.cache_dir).await {
                warn!(cache_dir = ?inner.cache_dir, error = %e, "Failed to recreate cache directory");
            }

            state.records.clear();
            state.quota_pending = false;
            info!(cache_dir = ?inner.cache_dir, "Disk cache cleared");
        })
        .await;
    }

    /// Run the quota check left pending by an earlier write
    pub async fn settle(&self) {
        let mut state = self.inner.state.lock().await;
        if state.quota_pending {
            self.inner.enforce_quota_locked(&mut state).await;
        }
    }

    /// Reconcile the directory with the metadata table
    ///
    /// Drops expired entries, records whose blob is missing and files that
    /// no record describes, then enforces the quota. Returns the number of
    /// entries and stray files removed, not counting quota evictions.
    pub async fn purge_expired(&self) -> usize {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let now = Utc::now();
        let mut purged = 0;

        let expired: Vec<String> = state
            .records
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(digest, _)| digest.clone())
            .collect();
        for digest in &expired {
            remove_blob(&inner.blob_path(digest)).await;
            state.records.remove(digest);
            purged += 1;
        }

        let mut missing = Vec::new();
        for digest in state.records.keys() {
            if !fs::try_exists(inner.blob_path(digest)).await.unwrap_or(false) {
                missing.push(digest.clone());
            }
        }
        for digest in &missing {
            state.records.remove(digest);
            purged += 1;
        }

        match fs::read_dir(&inner.cache_dir).await {
            Ok(mut entries) => loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to scan cache directory");
                        break;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == METADATA_FILE || state.records.contains_key(&name) {
                    continue;
                }
                debug!(file = %name, "Removing stray cache file");
                remove_blob(&entry.path()).await;
                purged += 1;
            },
            Err(e) => warn!(cache_dir = ?inner.cache_dir, error = %e, "Failed to scan cache directory"),
        }

        if !expired.is_empty() || !missing.is_empty() {
            if let Err(e) = inner.metadata.save(&state.records).await {
                warn!(error = %e, "Failed to save cache metadata");
            }
        }

        if purged > 0 {
            info!(purged, "Purged stale disk cache entries");
        }

        inner.enforce_quota_locked(&mut state).await;
        purged
    }

    /// Number of entries and their total size in bytes
    pub async fn stats(&self) -> (usize, u64) {
        let state = self.inner.state.lock().await;
        let total = state.records.values().map(|r| r.size_bytes).sum();
        (state.records.len(), total)
    }
}

impl DiskInner {
    fn blob_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(digest)
    }

    async fn write(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let digest = digest(key);
        let mut state = self.state.lock().await;

        // A previous write's quota check must land before this one's bookkeeping.
        if state.quota_pending {
            self.enforce_quota_locked(&mut state).await;
        }

        let result = self.write_locked(&mut state, &digest, key, data, expires_at).await;
        if result.is_err() {
            // The previous blob must not outlive a failed overwrite.
            remove_blob(&self.blob_path(&digest).with_extension("tmp")).await;
            self.delete_locked(&mut state, &digest).await;
        }
        result
    }

    async fn write_locked(
        &self,
        state: &mut DiskState,
        digest: &str,
        key: &str,
        data: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let path = self.blob_path(digest);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        let size = data.len() as u64;
        state
            .records
            .insert(digest.to_string(), CacheRecord::new(key, size, expires_at));
        state.quota_pending = true;
        self.metadata.save(&state.records).await?;

        debug!(key, size, "Stored blob on disk");
        Ok(())
    }

    async fn delete_locked(&self, state: &mut DiskState, digest: &str) {
        remove_blob(&self.blob_path(digest)).await;
        if state.records.remove(digest).is_some() {
            if let Err(e) = self.metadata.save(&state.records).await {
                warn!(error = %e, "Failed to save cache metadata");
            }
        }
    }

    /// Evict oldest-written entries until the total fits the quota
    async fn enforce_quota_locked(&self, state: &mut DiskState) -> usize {
        state.quota_pending = false;

        let mut total: u64 = state.records.values().map(|r| r.size_bytes).sum();
        if total <= self.quota {
            return 0;
        }

        let mut candidates = Vec::with_capacity(state.records.len());
        for (digest, record) in &state.records {
            let modified = fs::metadata(self.blob_path(digest))
                .await
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or(record.stored_at);
            candidates.push((modified, record.stored_at, digest.clone(), record.size_bytes));
        }
        candidates.sort();

        let mut evicted = 0;
        for (_, _, digest, size) in candidates {
            if total <= self.quota {
                break;
            }
            remove_blob(&self.blob_path(&digest)).await;
            state.records.remove(&digest);
            total = total.saturating_sub(size);
            evicted += 1;
            debug!(digest = %digest, size, "Evicted cache entry");
        }

        if let Err(e) = self.metadata.save(&state.records).await {
            warn!(error = %e, "Failed to save cache metadata");
        }

        info!(evicted, total_size = total, quota = self.quota, "Disk cache over quota");
        evicted
    }
}

/// Delete a file, ignoring absence
async fn remove_blob(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove cached blob");
        }
    }
}

/// Run `op` to completion on its own task, even if the caller goes away
pub(crate) async fn run_detached<F>(op: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(op).await {
        warn!(error = %e, "Cache task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn open(dir: &Path, quota: u64) -> DiskCache {
        let cache = DiskCache::open(dir.to_path_buf(), quota).await.unwrap();
        cache.ready().await;
        cache
    }

    fn blob_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != METADATA_FILE)
            .collect()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024 * 1024).await;

        cache.set_data(b"Hello, world!".to_vec(), "greeting", None).await;

        assert_eq!(cache.get_data("greeting").await.unwrap(), b"Hello, world!");
        assert!(dir.path().join(digest("greeting")).exists());
    }

    #[tokio::test]
    async fn test_get_miss() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        assert!(cache.get_data("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_bookkeeping() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache.set_data(vec![1; 100], "chart", Some(Duration::from_secs(60))).await;
        cache.set_data(vec![2; 10], "chart", None).await;

        assert_eq!(cache.get_data("chart").await.unwrap(), vec![2; 10]);
        assert_eq!(cache.stats().await, (1, 10));

        let hit = cache.lookup("chart").await.unwrap();
        assert!(hit.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged_on_read() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache
            .set_data(b"stale".to_vec(), "quote", Some(Duration::from_millis(50)))
            .await;
        assert!(cache.get_data("quote").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(cache.get_data("quote").await.is_none());
        assert!(!dir.path().join(digest("quote")).exists());
        assert_eq!(cache.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_missing_file_is_absent() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache.set_data(b"data".to_vec(), "k", None).await;
        std::fs::remove_file(dir.path().join(digest("k"))).unwrap();

        assert!(cache.get_data("k").await.is_none());
        assert_eq!(cache.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_file_without_record_is_absent() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        std::fs::write(dir.path().join(digest("k")), b"orphan").unwrap();

        assert!(cache.get_data("k").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_overwrite_drops_previous_blob() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache.set_data(b"old".to_vec(), "k", None).await;

        // A directory where the temporary blob goes makes the next write fail.
        let blocker = dir.path().join(digest("k")).with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();
        cache.set_data(b"new".to_vec(), "k", None).await;

        assert!(cache.get_data("k").await.is_none());
        assert!(!dir.path().join(digest("k")).exists());
        assert_eq!(cache.stats().await, (0, 0));

        // Once the obstruction is gone the key is writable again.
        std::fs::remove_dir(&blocker).unwrap();
        cache.set_data(b"newer".to_vec(), "k", None).await;
        assert_eq!(cache.get_data("k").await.unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_is_swallowed() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = open(&root, 1024).await;

        std::fs::remove_dir_all(&root).unwrap();
        cache.set_data(b"lost".to_vec(), "k", None).await;

        assert!(cache.get_data("k").await.is_none());
        assert_eq!(cache.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache.set_data(b"data".to_vec(), "k", None).await;
        cache.remove_data("k").await;
        cache.remove_data("k").await;
        cache.remove_data("never-set").await;

        assert!(cache.get_data("k").await.is_none());
        assert!(blob_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_cache_usable() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 1024).await;

        cache.set_data(b"one".to_vec(), "a", None).await;
        cache.set_data(b"two".to_vec(), "b", None).await;
        cache.clear_all().await;

        assert!(cache.get_data("a").await.is_none());
        assert!(cache.get_data("b").await.is_none());
        assert!(dir.path().is_dir());
        assert_eq!(cache.stats().await, (0, 0));

        cache.set_data(b"three".to_vec(), "c", None).await;
        assert_eq!(cache.get_data("c").await.unwrap(), b"three");
    }

    // Eviction follows write order (file modification time), not read order.
    #[tokio::test]
    async fn test_quota_evicts_oldest_written() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 20).await;

        cache.set_data(vec![b'a'; 10], "A", None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set_data(vec![b'b'; 10], "B", None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Reading A does not protect it.
        assert!(cache.get_data("A").await.is_some());

        cache.set_data(vec![b'c'; 10], "C", None).await;
        cache.settle().await;

        assert!(cache.get_data("A").await.is_none());
        assert!(cache.get_data("B").await.is_some());
        assert!(cache.get_data("C").await.is_some());
        assert_eq!(cache.stats().await, (2, 20));
    }

    #[tokio::test]
    async fn test_oversized_entry_is_evicted() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 8).await;

        cache.set_data(vec![0; 16], "huge", None).await;
        cache.settle().await;

        assert!(cache.get_data("huge").await.is_none());
        assert!(cache.stats().await.1 <= 8);
    }

    #[tokio::test]
    async fn test_next_write_settles_pending_quota() {
        let dir = tempdir().unwrap();
        let cache = open(dir.path(), 10).await;

        cache.set_data(vec![0; 10], "first", None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set_data(vec![1; 10], "second", None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set_data(vec![2; 5], "third", None).await;

        // Whatever the background checker did, only the latest write may exceed the quota.
        let (_, total) = cache.stats().await;
        assert!(total <= 15);
        assert!(cache.get_data("first").await.is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = open(dir.path(), 1024).await;
            cache.set_data(b"persisted".to_vec(), "logo", None).await;
        }

        let cache = open(dir.path(), 1024).await;
        assert_eq!(cache.get_data("logo").await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_purge_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = open(dir.path(), 1024).await;
            cache
                .set_data(b"short".to_vec(), "short", Some(Duration::from_millis(30)))
                .await;
            cache.set_data(b"long".to_vec(), "long", None).await;
        }
        std::fs::write(dir.path().join("stray.tmp"), b"interrupted").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cache = open(dir.path(), 1024).await;

        assert!(!dir.path().join(digest("short")).exists());
        assert!(!dir.path().join("stray.tmp").exists());
        assert_eq!(blob_files(dir.path()), vec![digest("long")]);
        assert_eq!(cache.stats().await, (1, 4));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_drops_entries() {
        let dir = tempdir().unwrap();
        {
            let cache = open(dir.path(), 1024).await;
            cache.set_data(b"data".to_vec(), "k", None).await;
        }
        std::fs::write(dir.path().join(METADATA_FILE), b"garbage").unwrap();

        let cache = open(dir.path(), 1024).await;

        assert!(cache.get_data("k").await.is_none());
        assert!(blob_files(dir.path()).is_empty());
    }
}
