//! Manifest commands

use super::Context;
use crate::format::{format_bytes, print_manifest, print_success};
use anyhow::{Context as _, Result};
use bytes::Bytes;
use clap::Subcommand;
use std::path::Path;
use tiercache_storage::PartitionId;

#[derive(Subcommand)]
pub enum ManifestCommands {
    /// Show the manifest of a partition
    Show {
        #[command(flatten)]
        partition: crate::PartitionArgs,
    },
    /// List partitions that have a manifest
    List {
        /// Only list partitions under this key prefix (e.g. a namespace)
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

pub async fn handle(ctx: &Context, command: ManifestCommands) -> Result<()> {
    match command {
        ManifestCommands::Show { partition } => {
            let partition = partition.id();
            let manifest = ctx
                .manifests
                .load(&partition)
                .await
                .with_context(|| format!("Failed to load manifest of {}", partition))?;
            print_manifest(&manifest);
        }
        ManifestCommands::List { prefix } => {
            let partitions = ctx
                .manifests
                .discover(&prefix)
                .await
                .context("Failed to list manifests")?;
            if partitions.is_empty() {
                println!("No manifests found");
            } else {
                println!("Partitions ({}):", partitions.len());
                for partition in partitions {
                    println!("  - {}", partition);
                }
            }
        }
    }
    Ok(())
}

/// Upload `file` as the segment `[base, committed)` and store the manifest.
pub async fn upload(
    ctx: &Context,
    partition: &PartitionId,
    base: u64,
    committed: u64,
    format_version: u32,
    file: &Path,
) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut manifest = ctx
        .manifests
        .load(partition)
        .await
        .with_context(|| format!("Failed to load manifest of {}", partition))?;

    let descriptor = ctx
        .manifests
        .upload_segment(&mut manifest, base, committed, Bytes::from(data), format_version)
        .await
        .context("Failed to tier segment")?;

    ctx.manifests
        .store(&mut manifest)
        .await
        .context("Failed to commit manifest; reload and retry")?;

    print_success(&format!(
        "Tiered [{}, {}) as {} ({})",
        descriptor.base_offset,
        descriptor.committed_offset,
        descriptor.remote_key,
        format_bytes(descriptor.size_bytes)
    ));
    println!("  Manifest revision: {}", manifest.revision);
    Ok(())
}
