//! tiercache Storage Layer
//!
//! This crate implements the tiered-storage cache layer of a log-structured storage
//! engine: the component that keeps track of which partition segments have been
//! uploaded to an object store, and serves them back from a bounded local disk cache.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐
//! │ Tiering controller   │  decides *when* to tier (external)
//! └──────────┬───────────┘
//!            │ upload_segment / prune / store
//!            ▼
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ ManifestStore        │───────▶│ RemoteStorageClient  │──▶ S3 / MinIO / GCS
//! │ - per-partition index│        │ - retry + backoff    │
//! │ - CAS on revision    │        │ - concurrency limit  │
//! └──────────┬───────────┘        └──────────▲───────────┘
//!            │ register_manifest             │ get (on miss)
//!            ▼                               │
//! ┌──────────────────────┐                   │
//! │ CacheService         │───────────────────┘
//! │ - verified hits      │
//! │ - fetch dedup        │
//! │ - LRU byte budget    │
//! └──────────┬───────────┘
//!            │ startup reconciliation
//!            ▼
//! ┌──────────────────────┐
//! │ DirectoryWalker      │  lazy walk of the cache tree
//! └──────────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`DirectoryWalker`]: enumerates every file below the cache root without recursion
//! - [`RemoteStorageClient`]: put/get/delete/list against an `object_store` backend
//! - [`Manifest`] / [`ManifestStore`]: offset-range index of remote segments, stored
//!   with optimistic concurrency
//! - [`CacheService`]: local disk cache keyed by remote object key
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use object_store::memory::InMemory;
//! use tiercache_storage::{CacheConfig, CacheService, ManifestStore, PartitionId, RemoteStorageClient};
//!
//! let config = CacheConfig::from_env()?;
//! let remote = Arc::new(RemoteStorageClient::new(Arc::new(InMemory::new()), &config.remote));
//! let manifests = ManifestStore::with_checksum(remote.clone(), config.checksum);
//!
//! // Tier a segment
//! let partition = PartitionId::new("kafka", "orders", 0);
//! let mut manifest = manifests.load(&partition).await?;
//! manifests.upload_segment(&mut manifest, 0, 100, segment_bytes, 1).await?;
//! manifests.store(&mut manifest).await?;
//!
//! // Serve it through the cache
//! let cache = CacheService::new(config, remote)?;
//! cache.register_manifest(manifest).await?;
//! cache.reconcile_on_startup().await?;
//! let segments = cache.read(&partition, 50..150).await?;
//! ```

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod manifest;
pub mod remote;
pub mod retry;
pub mod walker;

pub use cache::{CacheEntry, CacheService, CacheStats, EvictionState, KeyState, ReconcileReport};
pub use checksum::ChecksumAlgorithm;
pub use config::{CacheConfig, RemoteConfig};
pub use error::{Error, Result};
pub use manifest::{
    manifest_key, segment_key, Manifest, ManifestStore, PartitionId, SegmentDescriptor,
};
pub use remote::{ObjectVersion, PutCondition, RemoteStorageClient, VersionedObject};
pub use retry::RetryPolicy;
pub use walker::{DirectoryWalker, Walk, WalkEntry, WalkError};
