//! Two-tier cache with TTL expiration and quota-bounded eviction
//!
//! Structured values and raw blobs are held in an in-process moka cache
//! backed by content-addressed files on disk. Lookups check memory first
//! and promote disk hits; writes go to both tiers. The disk tier keeps a
//! metadata table next to its blobs and evicts the oldest-written entries
//! once a size quota is exceeded.
//!
//! Cache operations never fail from the caller's point of view: I/O and
//! decoding problems are logged and surface as misses.

mod cache;
mod config;
mod disk;
mod error;
pub mod key;
mod memory;
mod metadata;
mod types;

pub use cache::TieredCache;
pub use config::CacheConfig;
pub use disk::DiskCache;
pub use error::{CacheError, Result};
pub use memory::{MemoryCache, MemoryPressureHandle};
pub use metadata::{MetadataStore, RecordTable, METADATA_FILE};
pub use types::{CacheRecord, CacheStats};
