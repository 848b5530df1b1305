use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CacheError, Result};

const DEFAULT_CACHE_DIR: &str = "./cache/data";
const DEFAULT_MEMORY_MAX_ENTRIES: u64 = 100;
const DEFAULT_MEMORY_MAX_COST: u64 = 50 * 1024 * 1024; // 50 MiB
const DEFAULT_DISK_QUOTA: u64 = 100 * 1024 * 1024; // 100 MiB
const DEFAULT_IMAGE_PREFIX: &str = "image:";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding blob files and the metadata table
    pub cache_dir: PathBuf,
    pub memory_max_entries: u64,
    /// Memory budget in bytes
    pub memory_max_cost: u64,
    /// Disk quota in bytes
    pub disk_quota: u64,
    /// Applied when `set` is called without an expiry
    pub default_ttl: Option<Duration>,
    /// Namespace for raw-bytes (image) keys
    pub image_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            memory_max_cost: DEFAULT_MEMORY_MAX_COST,
            disk_quota: DEFAULT_DISK_QUOTA,
            default_ttl: None,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_DIR));

        let memory_max_entries = env::var("MEMORY_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MEMORY_MAX_ENTRIES);

        let memory_max_cost = env::var("MEMORY_MAX_COST")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MEMORY_MAX_COST);

        let disk_quota = env::var("MAX_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_DISK_QUOTA);

        let default_ttl = env::var("CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let image_prefix =
            env::var("IMAGE_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_IMAGE_PREFIX.to_string());

        Self {
            cache_dir,
            memory_max_entries,
            memory_max_cost,
            disk_quota,
            default_ttl,
            image_prefix,
        }
    }

    /// Use a different cache directory
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.memory_max_entries == 0 {
            return Err(CacheError::Config(
                "MEMORY_MAX_ENTRIES must be positive".to_string(),
            ));
        }
        if self.memory_max_cost == 0 {
            return Err(CacheError::Config(
                "MEMORY_MAX_COST must be positive".to_string(),
            ));
        }
        if self.image_prefix.is_empty() {
            return Err(CacheError::Config(
                "IMAGE_KEY_PREFIX must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./cache/data"));
        assert_eq!(config.memory_max_entries, 100);
        assert_eq!(config.memory_max_cost, 50 * 1024 * 1024);
        assert_eq!(config.disk_quota, 100 * 1024 * 1024);
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.image_prefix, "image:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_cache_dir() {
        let config = CacheConfig::default().with_cache_dir("/tmp/market-cache");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/market-cache"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = CacheConfig {
            memory_max_entries: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            memory_max_cost: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_image_prefix() {
        let config = CacheConfig {
            image_prefix: String::new(),
            ..CacheConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("IMAGE_KEY_PREFIX"));
    }
}
