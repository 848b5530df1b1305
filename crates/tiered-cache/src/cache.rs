//! The public two-tier cache
//!
//! Lookups go memory first, then disk; disk hits are decoded and promoted
//! into memory. Writes go to both tiers. Nothing here ever returns an
//! error to the caller: every failure is logged and degrades to a miss.

use crate::config::CacheConfig;
use crate::disk::{run_detached, DiskCache};
use crate::error::Result;
use crate::key::image_key;
use crate::memory::{MemoryCache, MemoryPressureHandle};
use crate::types::{expiry_from_ttl, CacheStats};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Memory + disk cache for structured values and raw blobs
pub struct TieredCache {
    memory: MemoryCache,
    disk: DiskCache,
    config: CacheConfig,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    /// Open the cache described by `config`
    ///
    /// Must be called from within a tokio runtime; the disk tier starts a
    /// background purge of stale entries.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let disk = DiskCache::open(config.cache_dir.clone(), config.disk_quota).await?;
        let memory = MemoryCache::new(config.memory_max_entries, config.memory_max_cost);

        info!(
            memory_max_entries = config.memory_max_entries,
            memory_max_cost = config.memory_max_cost,
            "Cache opened"
        );

        Ok(Self {
            memory,
            disk,
            config,
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Wait until stale entries from a previous process have been purged
    pub async fn ready(&self) {
        self.disk.ready().await;
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Get a structured value
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.memory.get::<T>(key).await {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Memory cache hit");
            return Some(value);
        }

        let Some(hit) = self.disk.lookup(key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache miss");
            return None;
        };

        match serde_json::from_slice::<T>(&hit.data) {
            Ok(value) => {
                self.memory
                    .insert(key, value.clone(), hit.data.len() as u64, hit.expires_at)
                    .await;
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "Cached value failed to decode, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a structured value in both tiers
    ///
    /// `ttl` falls back to the configured default; with neither, the entry
    /// only leaves by eviction or removal. A value that cannot be encoded
    /// is still held in memory for the rest of the process.
    pub async fn set<T>(&self, value: T, key: &str, ttl: Option<Duration>)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let ttl = ttl.or(self.config.default_ttl);
        if ttl == Some(Duration::ZERO) {
            self.remove(key).await;
            return;
        }
        let expires_at = ttl.and_then(expiry_from_ttl);

        let memory = self.memory.clone();
        let disk = self.disk.clone();
        let key = key.to_string();
        run_detached(async move {
            match serde_json::to_vec(&value) {
                Ok(bytes) => {
                    memory
                        .insert(&key, value, bytes.len() as u64, expires_at)
                        .await;
                    disk.store(bytes, &key, expires_at).await;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Value not encodable, caching in memory only");
                    let cost = std::mem::size_of::<T>() as u64;
                    memory.insert(&key, value, cost, expires_at).await;
                    // An older disk copy would otherwise resurface after memory eviction.
                    disk.remove_data(&key).await;
                }
            }
        })
        .await;
    }

    /// Remove a structured value from both tiers
    pub async fn remove(&self, key: &str) {
        self.remove_both(key.to_string()).await;
    }

    /// Drop `key` from both tiers on a task that outlives the caller
    async fn remove_both(&self, key: String) {
        let memory = self.memory.clone();
        let disk = self.disk.clone();
        run_detached(async move {
            memory.remove(&key).await;
            disk.remove_data(&key).await;
        })
        .await;
    }

    /// Empty both tiers
    pub async fn clear_all(&self) {
        self.memory.clear();
        self.disk.clear_all().await;
        info!("Cache cleared");
    }

    /// Get a raw blob (e.g. an image) stored with [`TieredCache::set_image`]
    pub async fn get_image(&self, key: &str) -> Option<Vec<u8>> {
        let key = image_key(&self.config.image_prefix, key);

        if let Some(data) = self.memory.get::<Vec<u8>>(&key).await {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(data);
        }

        match self.disk.lookup(&key).await {
            Some(hit) => {
                let cost = hit.data.len() as u64;
                self.memory
                    .insert(&key, hit.data.clone(), cost, hit.expires_at)
                    .await;
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                Some(hit.data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a raw blob in both tiers, without any encoding
    pub async fn set_image(&self, data: Vec<u8>, key: &str, ttl: Option<Duration>) {
        let key = image_key(&self.config.image_prefix, key);
        let ttl = ttl.or(self.config.default_ttl);
        if ttl == Some(Duration::ZERO) {
            self.remove_both(key).await;
            return;
        }
        let expires_at = ttl.and_then(expiry_from_ttl);

        let memory = self.memory.clone();
        let disk = self.disk.clone();
        run_detached(async move {
            let cost = data.len() as u64;
            memory.insert(&key, data.clone(), cost, expires_at).await;
            disk.store(data, &key, expires_at).await;
        })
        .await;
    }

    pub async fn remove_image(&self, key: &str) {
        self.remove_both(image_key(&self.config.image_prefix, key))
            .await;
    }

    /// A cloneable callback for the host's low-memory notification
    pub fn memory_pressure_handle(&self) -> MemoryPressureHandle {
        self.memory.pressure_handle()
    }

    /// Drop the memory tier; the disk tier is unaffected
    pub fn on_memory_pressure(&self) {
        self.memory_pressure_handle().notify();
    }

    /// Purge expired and orphaned disk entries now
    pub async fn purge_expired(&self) -> usize {
        self.disk.purge_expired().await
    }

    /// Finish any quota enforcement still pending after recent writes
    pub async fn settle(&self) {
        self.disk.settle().await;
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_weight) = self.memory.stats().await;
        let (disk_entries, disk_size) = self.disk.stats().await;

        CacheStats {
            memory_entries,
            memory_weight,
            disk_entries,
            disk_size,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
