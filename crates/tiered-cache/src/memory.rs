//! Memory tier backed by a moka async cache
//!
//! Entries are keyed by the logical key and hold type-erased values.
//! The cache is bounded by both an entry count and a total cost in bytes:
//! moka only knows one capacity, so every entry is charged at least
//! `max_cost / max_entries`, which makes the weight budget unable to hold
//! more than `max_entries` entries.

use crate::types::remaining;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Clone)]
struct MemoryEntry {
    value: Arc<dyn Any + Send + Sync>,
    weight: u32,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn time_to_live(&self) -> Option<Duration> {
        self.expires_at.map(remaining)
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Per-entry expiry derived from each entry's absolute deadline
struct EntryExpiry;

impl Expiry<String, MemoryEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.time_to_live()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.time_to_live()
    }
}

/// In-process cache tier
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, MemoryEntry>,
    min_weight: u64,
}

impl MemoryCache {
    /// Create a tier holding at most `max_entries` entries and `max_cost` bytes
    ///
    /// A `max_entries` of zero is treated as one.
    pub fn new(max_entries: u64, max_cost: u64) -> Self {
        let max_entries = max_entries.max(1);
        let entries = Cache::builder()
            .max_capacity(max_cost)
            .weigher(|_key: &String, entry: &MemoryEntry| entry.weight)
            .expire_after(EntryExpiry)
            .build();

        Self {
            entries,
            min_weight: max_cost.div_ceil(max_entries).max(1),
        }
    }

    /// Look up `key`, returning `None` on a miss, an expired entry, or a
    /// value of a different type
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.get(key).await?;
        // moka drops it on its own schedule; invalidating here could hit a fresh replacement.
        if entry.is_expired() {
            debug!(key, "Memory cache entry expired");
            return None;
        }

        match entry.value.downcast::<T>() {
            Ok(value) => Some(T::clone(&value)),
            Err(_) => {
                debug!(key, "Memory cache entry has a different type");
                None
            }
        }
    }

    /// Insert `value` charged at `cost` bytes
    ///
    /// An already-expired deadline removes the key instead.
    pub async fn insert<T>(&self, key: &str, value: T, cost: u64, expires_at: Option<DateTime<Utc>>)
    where
        T: Send + Sync + 'static,
    {
        if expires_at.is_some_and(|at| at <= Utc::now()) {
            self.entries.invalidate(key).await;
            return;
        }

        let weight = cost.max(self.min_weight).min(u32::MAX as u64) as u32;
        let entry = MemoryEntry {
            value: Arc::new(value),
            weight,
            expires_at,
        };
        self.entries.insert(key.to_string(), entry).await;
    }

    pub async fn remove(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// A handle the host environment can signal on memory pressure
    pub fn pressure_handle(&self) -> MemoryPressureHandle {
        MemoryPressureHandle {
            memory: self.clone(),
        }
    }

    /// Entry count and weighted size once pending maintenance has run
    pub async fn stats(&self) -> (u64, u64) {
        self.entries.run_pending_tasks().await;
        (self.entries.entry_count(), self.entries.weighted_size())
    }
}

/// Drops the memory tier when the host reports memory pressure
///
/// The disk tier is left alone, so values stay recoverable after the drop.
#[derive(Clone)]
pub struct MemoryPressureHandle {
    memory: MemoryCache,
}

impl MemoryPressureHandle {
    pub fn notify(&self) {
        info!("Memory pressure signalled, dropping memory cache");
        self.memory.clear();
    }
}
