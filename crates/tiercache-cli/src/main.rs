//! tiercache CLI (tierctl)
//!
//! Operator tool for inspecting and exercising the tiered-storage cache layer.
//!
//! ## Overview
//!
//! `tierctl` works directly against the object store and a local cache directory:
//! - **Manifests**: Show a partition's manifest, list tiered partitions
//! - **Upload**: Tier a segment file and commit it to the partition manifest
//! - **Read**: Resolve an offset range and read it through the cache
//! - **Reconcile**: Rebuild the cache index from the cache directory
//! - **Stats**: Cache statistics and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```bash
//! # Local object store for development
//! export TIERCACHE_STORE_PATH=./data/storage
//! export TIERCACHE_CACHE_DIR=./data/cache
//!
//! # Tier a segment covering offsets [0, 1000)
//! tierctl upload kafka orders 0 --base 0 --committed 1000 ./segment.bin
//!
//! # Inspect the manifest
//! tierctl manifest show kafka orders 0
//!
//! # Read offsets 250..750 through the cache
//! tierctl read kafka orders 0 --from 250 --to 750
//!
//! # S3 (credentials and region from the usual AWS_* variables)
//! tierctl --bucket my-bucket manifest list
//! ```
//!
//! ## Configuration
//!
//! Flags fall back to environment variables:
//! - `TIERCACHE_CACHE_DIR`, `TIERCACHE_CACHE_SIZE`
//! - `TIERCACHE_STORE_PATH` (local filesystem) or `TIERCACHE_BUCKET` (S3)
//! - `TIERCACHE_CHECKSUM`, `TIERCACHE_REMOTE_CONCURRENCY`, `TIERCACHE_REMOTE_TIMEOUT_MS`,
//!   `TIERCACHE_RETRY_ATTEMPTS`
//! - `RUST_LOG` for log verbosity (default: `warn`)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tiercache_storage::{CacheConfig, PartitionId, RemoteStorageClient};

mod commands;
mod format;

#[derive(Parser)]
#[command(name = "tierctl")]
#[command(about = "tiercache command-line tool", long_about = None)]
struct Cli {
    /// Local cache directory
    #[arg(long, env = "TIERCACHE_CACHE_DIR", default_value = "./data/cache")]
    cache_dir: PathBuf,

    /// Cache byte budget
    #[arg(long, env = "TIERCACHE_CACHE_SIZE", default_value = "1073741824")]
    cache_size: u64,

    /// Use a local directory as the object store
    #[arg(long, env = "TIERCACHE_STORE_PATH", conflicts_with = "bucket")]
    store_path: Option<PathBuf>,

    /// Use an S3 bucket as the object store
    #[arg(long, env = "TIERCACHE_BUCKET")]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manifest inspection commands
    Manifest {
        #[command(subcommand)]
        command: commands::ManifestCommands,
    },
    /// Tier a segment file and commit it to the manifest
    Upload {
        #[command(flatten)]
        partition: PartitionArgs,
        /// First offset covered by the segment
        #[arg(long)]
        base: u64,
        /// Offset after the last record of the segment
        #[arg(long)]
        committed: u64,
        /// Segment format version
        #[arg(long, default_value = "1")]
        format_version: u32,
        /// Segment file to upload
        file: PathBuf,
    },
    /// Read an offset range through the cache
    Read {
        #[command(flatten)]
        partition: PartitionArgs,
        /// First offset to read
        #[arg(long)]
        from: u64,
        /// Offset after the last one to read
        #[arg(long)]
        to: u64,
        /// Write the segment bytes, concatenated, to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rebuild the cache index from the cache directory
    Reconcile,
    /// Show cache statistics
    Stats {
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(clap::Args, Clone)]
pub struct PartitionArgs {
    /// Namespace
    pub namespace: String,
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: u32,
}

impl PartitionArgs {
    pub fn id(&self) -> PartitionId {
        PartitionId::new(&self.namespace, &self.topic, self.partition)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    tiercache_observability::init();

    let cli = Cli::parse();
    let config = CacheConfig {
        cache_dir: cli.cache_dir.clone(),
        max_size_bytes: cli.cache_size,
        ..CacheConfig::from_env().context("Invalid TIERCACHE_* environment")?
    };
    config.validate().context("Invalid cache configuration")?;

    let store = build_store(&cli)?;
    let remote = Arc::new(RemoteStorageClient::new(store, &config.remote));
    let ctx = commands::Context::new(config, remote);

    match cli.command {
        Commands::Manifest { command } => commands::manifest::handle(&ctx, command).await?,
        Commands::Upload {
            partition,
            base,
            committed,
            format_version,
            file,
        } => {
            commands::manifest::upload(&ctx, &partition.id(), base, committed, format_version, &file)
                .await?
        }
        Commands::Read {
            partition,
            from,
            to,
            output,
        } => commands::cache::read(&ctx, &partition.id(), from, to, output.as_deref()).await?,
        Commands::Reconcile => commands::cache::reconcile(&ctx).await?,
        Commands::Stats { metrics } => commands::cache::stats(&ctx, metrics).await?,
    }

    Ok(())
}

fn build_store(cli: &Cli) -> Result<Arc<dyn ObjectStore>> {
    if let Some(path) = &cli.store_path {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create store directory {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Using local object store");
        let store = object_store::local::LocalFileSystem::new_with_prefix(path)
            .context("Failed to open local object store")?;
        return Ok(Arc::new(store));
    }

    if let Some(bucket) = &cli.bucket {
        tracing::debug!(bucket = %bucket, "Using S3 object store");
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .context("Failed to configure S3 object store")?;
        return Ok(Arc::new(store));
    }

    bail!("no object store configured: pass --store-path or --bucket")
}
