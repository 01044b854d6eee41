//! Command handlers for tierctl
//!
//! - Manifest: inspect manifests and tier new segments
//! - Cache: read through the cache, reconcile, statistics

pub mod cache;
pub mod manifest;

pub use manifest::ManifestCommands;

use anyhow::{Context as _, Result};
use std::sync::Arc;
use tiercache_storage::{
    CacheConfig, CacheService, ManifestStore, ReconcileReport, RemoteStorageClient,
};

/// Shared handles for every command.
pub struct Context {
    pub config: CacheConfig,
    pub remote: Arc<RemoteStorageClient>,
    pub manifests: ManifestStore,
}

impl Context {
    pub fn new(config: CacheConfig, remote: Arc<RemoteStorageClient>) -> Self {
        let manifests = ManifestStore::with_checksum(remote.clone(), config.checksum);
        Self {
            config,
            remote,
            manifests,
        }
    }

    /// Open the cache with every remote manifest registered and the local
    /// directory reconciled against them.
    pub async fn open_cache(&self) -> Result<(CacheService, ReconcileReport)> {
        let cache = CacheService::new(self.config.clone(), self.remote.clone())
            .context("Failed to open cache directory")?;

        let partitions = self
            .manifests
            .discover("")
            .await
            .context("Failed to list manifests")?;
        for partition in partitions {
            let manifest = self
                .manifests
                .load(&partition)
                .await
                .with_context(|| format!("Failed to load manifest of {}", partition))?;
            cache.register_manifest(manifest).await?;
        }

        let report = cache
            .reconcile_on_startup()
            .await
            .context("Failed to reconcile cache directory")?;
        Ok((cache, report))
    }
}
