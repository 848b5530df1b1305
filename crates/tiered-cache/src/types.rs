//! Cache types

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata for a blob stored in the disk tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Logical key the blob was stored under
    pub key: String,
    pub size_bytes: u64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Write time; breaks ties when file modification times are equal or unreadable
    pub stored_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(key: &str, size_bytes: u64, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.to_string(),
            size_bytes,
            expires_at,
            stored_at: Utc::now(),
        }
    }

    /// Whether the record is logically absent at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Statistics about both cache tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: u64,
    /// Weighted size charged against the memory budget
    pub memory_weight: u64,
    pub disk_entries: usize,
    pub disk_size: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
}

/// Convert a relative TTL into an absolute expiry
///
/// Returns `None` when the TTL cannot be represented, which callers treat
/// as "never expires by time".
pub(crate) fn expiry_from_ttl(ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = ChronoDuration::from_std(ttl).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// Time left until `expires_at`, saturating at zero
pub(crate) fn remaining(expires_at: DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
