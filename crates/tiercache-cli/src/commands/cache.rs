//! Cache commands

use super::Context;
use crate::format::{format_bytes, segment_row};
use anyhow::{Context as _, Result};
use std::path::Path;
use tiercache_storage::{PartitionId, ReconcileReport};

pub async fn read(
    ctx: &Context,
    partition: &PartitionId,
    from: u64,
    to: u64,
    output: Option<&Path>,
) -> Result<()> {
    let (cache, _) = ctx.open_cache().await?;

    let segments = cache
        .read(partition, from..to)
        .await
        .with_context(|| format!("Failed to read [{}, {}) of {}", from, to, partition))?;

    if segments.is_empty() {
        println!("No tiered segments intersect [{}, {})", from, to);
        return Ok(());
    }

    println!("Segments ({}):", segments.len());
    let mut total = 0u64;
    for (descriptor, data) in &segments {
        println!("{}", segment_row(descriptor));
        total += data.len() as u64;
    }
    println!("Read {}", format_bytes(total));

    if let Some(path) = output {
        let mut body = Vec::with_capacity(total as usize);
        for (_, data) in &segments {
            body.extend_from_slice(data);
        }
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

pub async fn reconcile(ctx: &Context) -> Result<()> {
    let (_, report) = ctx.open_cache().await?;
    print_report(&report);
    Ok(())
}

pub async fn stats(ctx: &Context, metrics: bool) -> Result<()> {
    let (cache, _) = ctx.open_cache().await?;
    let stats = cache.stats();

    println!("Cache: {}", ctx.config.cache_dir.display());
    println!("  Entries: {}", stats.entry_count);
    println!(
        "  Size: {} / {} ({:.1}%)",
        format_bytes(stats.current_size),
        format_bytes(stats.max_size),
        stats.utilization_pct
    );
    println!("  Partitions: {}", cache.partitions().len());
    println!(
        "  Remote concurrency: {}",
        ctx.remote.max_concurrent_requests()
    );

    if metrics {
        println!();
        print!(
            "{}",
            tiercache_observability::gather_text().context("Failed to render metrics")?
        );
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    println!("Reconciled cache directory:");
    println!("  Scanned: {}", report.scanned);
    println!("  Retained: {}", report.retained);
    println!("  Removed partial: {}", report.removed_partial);
    println!("  Removed orphaned: {}", report.removed_orphaned);
    println!("  Removed corrupt: {}", report.removed_corrupt);
    println!("  Evicted: {}", report.evicted);
    if report.walk_errors > 0 {
        println!("  Unreadable paths: {}", report.walk_errors);
    }
    println!("  Resident: {}", format_bytes(report.resident_bytes));
}
