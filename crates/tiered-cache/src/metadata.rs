//! Persistent metadata table for the disk tier
//!
//! The table is a single JSON object mapping blob digests to their
//! [`CacheRecord`]. Every mutation rewrites the whole file, which keeps
//! the format trivial but amplifies writes as the entry count grows.

use crate::error::Result;
use crate::types::CacheRecord;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// File name of the metadata table inside the cache directory
pub const METADATA_FILE: &str = "metadata.json";

pub type RecordTable = HashMap<String, CacheRecord>;

/// Reads and writes the metadata table co-located with the blobs
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table. A missing or unreadable table is empty.
    pub async fn load(&self) -> Result<RecordTable> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RecordTable::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<RecordTable>(&bytes) {
            Ok(records) => {
                debug!(path = ?self.path, records = records.len(), "Loaded cache metadata");
                Ok(records)
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Discarding unreadable cache metadata");
                Ok(RecordTable::new())
            }
        }
    }

    /// Rewrite the whole table
    pub async fn save(&self, records: &RecordTable) -> Result<()> {
        let bytes = serde_json::to_vec(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::digest;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_missing_table_is_empty() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());

        let mut records = RecordTable::new();
        records.insert(
            digest("quotes:AAPL"),
            CacheRecord::new("quotes:AAPL", 42, None),
        );
        records.insert(
            digest("quotes:MSFT"),
            CacheRecord::new("quotes:MSFT", 7, None),
        );
        store.save(&records).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, records);
        assert!(!dir.path().join("metadata.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_table() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());

        let mut records = RecordTable::new();
        records.insert(digest("a"), CacheRecord::new("a", 1, None));
        store.save(&records).await.unwrap();

        records.clear();
        store.save(&records).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_table_is_empty() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();

        assert!(store.load().await.unwrap().is_empty());
    }
}
