//! Tiered cache CLI - inspect and maintain a cache directory
//!
//! Opens the cache described by the environment (CACHE_DIR, MAX_CACHE_SIZE,
//! CACHE_TTL_SECS, ...) and runs a single operation against it.

mod error;

use crate::error::{CliError, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tiered_cache::{CacheConfig, TieredCache};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tiered-cache")]
#[command(version, about = "Inspect and maintain a tiered cache directory")]
struct Cli {
    /// Cache directory (overrides CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print entry counts, sizes and quota
    Stats,
    /// Print a cached value
    Get {
        key: String,
        /// Read from the raw-bytes (image) namespace
        #[arg(long)]
        image: bool,
        /// Write the value to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Cache a JSON value
    Set {
        key: String,
        json: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Cache a file's bytes in the image namespace
    SetImage {
        key: String,
        path: PathBuf,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Remove a cached value
    Remove {
        key: String,
        #[arg(long)]
        image: bool,
    },
    /// Remove every cached value
    Clear,
    /// Drop expired and orphaned entries and enforce the quota
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("tiered_cache=info".parse()?)
        .add_directive("tiered_cache_cli=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let mut config = CacheConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config = config.with_cache_dir(dir);
    }
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Max cache size: {} MB", config.disk_quota / (1024 * 1024));

    let cache = TieredCache::open(config).await?;
    cache.ready().await;
    let mut stdout = std::io::stdout().lock();
    execute(&cache, cli.command, &mut stdout).await
}

async fn execute(cache: &TieredCache, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Stats => {
            let stats = cache.stats().await;
            writeln!(out, "entries: {}", stats.disk_entries)?;
            writeln!(out, "size: {} bytes", stats.disk_size)?;
            writeln!(out, "quota: {} bytes", cache.config().disk_quota)?;
        }
        Command::Get { key, image, out: path } => {
            let data = if image {
                cache.get_image(&key).await
            } else {
                match cache.get::<serde_json::Value>(&key).await {
                    Some(value) => Some(serde_json::to_vec_pretty(&value)?),
                    None => None,
                }
            };

            let Some(data) = data else {
                info!(key = %key, "Not cached");
                return Ok(());
            };

            match path {
                Some(path) => tokio::fs::write(&path, &data).await?,
                None => {
                    out.write_all(&data)?;
                    if !image {
                        writeln!(out)?;
                    }
                }
            }
        }
        Command::Set {
            key,
            json,
            ttl_secs,
        } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            cache.set(value, &key, ttl_secs.map(Duration::from_secs)).await;
            cache.settle().await;
        }
        Command::SetImage {
            key,
            path,
            ttl_secs,
        } => {
            let data = tokio::fs::read(&path).await?;
            if data.is_empty() {
                return Err(CliError::Config(format!("{} is empty", path.display())));
            }
            cache
                .set_image(data, &key, ttl_secs.map(Duration::from_secs))
                .await;
            cache.settle().await;
        }
        Command::Remove { key, image } => {
            if image {
                cache.remove_image(&key).await;
            } else {
                cache.remove(&key).await;
            }
        }
        Command::Clear => cache.clear_all().await,
        Command::Purge => {
            let purged = cache.purge_expired().await;
            writeln!(out, "purged: {}", purged)?;
        }
    }

    Ok(())
}
