//! Read an offset range of a tiered partition from a local MinIO.
//!
//! ```bash
//! cargo run -p tiercache-storage --example tiered_reader -- kafka orders 0 0 1000
//! ```

use object_store::{aws::AmazonS3Builder, ObjectStore};
use std::sync::Arc;
use tiercache_storage::{
    CacheConfig, CacheService, ManifestStore, PartitionId, RemoteStorageClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!(
            "Usage: {} <namespace> <topic> <partition> [from_offset] [to_offset]",
            args[0]
        );
        std::process::exit(1);
    }

    let partition = PartitionId::new(&args[1], &args[2], args[3].parse()?);
    let from: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0);
    let to: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(u64::MAX);

    let object_store: Arc<dyn ObjectStore> = Arc::new(
        AmazonS3Builder::new()
            .with_bucket_name("tiercache")
            .with_region("us-east-1")
            .with_endpoint("http://localhost:9000")
            .with_access_key_id("minioadmin")
            .with_secret_access_key("minioadmin")
            .with_allow_http(true)
            .build()?,
    );

    let config = CacheConfig {
        cache_dir: "/tmp/tiercache-read-cache".into(),
        max_size_bytes: 100 * 1024 * 1024,
        ..Default::default()
    };
    let remote = Arc::new(RemoteStorageClient::new(object_store, &config.remote));
    let manifests = ManifestStore::with_checksum(remote.clone(), config.checksum);
    let cache = CacheService::new(config, remote)?;

    let manifest = manifests.load(&partition).await?;
    println!(
        "\n📖 {} at revision {} ({} segments)",
        partition,
        manifest.revision,
        manifest.len()
    );
    cache.register_manifest(manifest).await?;

    let report = cache.reconcile_on_startup().await?;
    println!("   Reused {} cached segments\n", report.retained);

    for (segment, data) in cache.read(&partition, from..to).await? {
        println!(
            "   [{}, {}) {} bytes from {}",
            segment.base_offset,
            segment.committed_offset,
            data.len(),
            segment.remote_key
        );
    }

    let stats = cache.stats();
    println!(
        "\n✅ hits={} misses={} cached={} bytes",
        stats.hits, stats.misses, stats.current_size
    );
    Ok(())
}
