//! Shared helpers for the integration tests.
//!
//! [`FaultyStore`] wraps an in-memory object store and lets a test script failures,
//! slow responses and corrupted downloads while counting every call that reaches
//! the transport.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::memory::InMemory;
use object_store::{
    path::Path, GetOptions, GetResult, GetResultPayload, ListResult, MultipartId, ObjectMeta,
    ObjectStore, PutOptions, PutResult, Result,
};
use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tiercache_storage::{
    CacheConfig, CacheService, ChecksumAlgorithm, Manifest, PartitionId, RemoteConfig,
    RemoteStorageClient, RetryPolicy, SegmentDescriptor,
};
use tokio::io::AsyncWrite;

/// Failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 503 SlowDown
    Transient,
    /// Missing object
    NotFound,
    /// 403 AccessDenied
    PermissionDenied,
}

impl Fault {
    fn into_error(self, path: &Path) -> object_store::Error {
        match self {
            Fault::Transient => object_store::Error::Generic {
                store: "faulty",
                source: "503 Service Unavailable: SlowDown".into(),
            },
            Fault::NotFound => object_store::Error::NotFound {
                path: path.to_string(),
                source: "injected".into(),
            },
            Fault::PermissionDenied => object_store::Error::Generic {
                store: "faulty",
                source: "403 Forbidden: AccessDenied".into(),
            },
        }
    }
}

/// Call-counting, fault-injecting wrapper around [`InMemory`].
pub struct FaultyStore {
    inner: InMemory,
    gets: AtomicUsize,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    get_faults: Mutex<VecDeque<Fault>>,
    put_faults: Mutex<VecDeque<Fault>>,
    corrupt_gets: AtomicUsize,
    get_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemory::new(),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            get_faults: Mutex::new(VecDeque::new()),
            put_faults: Mutex::new(VecDeque::new()),
            corrupt_gets: AtomicUsize::new(0),
            get_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next gets, one fault per call, in order.
    pub fn fail_gets(&self, faults: &[Fault]) {
        self.get_faults.lock().unwrap().extend(faults.iter().copied());
    }

    pub fn fail_puts(&self, faults: &[Fault]) {
        self.put_faults.lock().unwrap().extend(faults.iter().copied());
    }

    /// Flip a byte in the payload of the next `n` successful gets.
    pub fn corrupt_next_gets(&self, n: usize) {
        self.corrupt_gets.store(n, Ordering::SeqCst);
    }

    /// Delay every get by `delay`.
    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous get/put calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.gets.store(0, Ordering::SeqCst);
        self.puts.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(&self.in_flight)
    }

    async fn get_hook(&self, location: &Path) -> Result<()> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self.get_faults.lock().unwrap().pop_front();
        match fault {
            Some(fault) => Err(fault.into_error(location)),
            None => Ok(()),
        }
    }

    fn put_hook(&self, location: &Path) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let fault = self.put_faults.lock().unwrap().pop_front();
        match fault {
            Some(fault) => Err(fault.into_error(location)),
            None => Ok(()),
        }
    }

    async fn maybe_corrupt(&self, result: GetResult) -> Result<GetResult> {
        let corrupt = self
            .corrupt_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !corrupt {
            return Ok(result);
        }

        let meta = result.meta.clone();
        let range = result.range.clone();
        let mut data = result.bytes().await?.to_vec();
        if let Some(first) = data.first_mut() {
            *first ^= 0xff;
        } else {
            data.push(0xff);
        }
        let payload = futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed();
        Ok(GetResult {
            payload: GetResultPayload::Stream(payload),
            meta,
            range,
        })
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Debug for FaultyStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore")
            .field("gets", &self.gets())
            .field("puts", &self.puts())
            .finish()
    }
}

impl Display for FaultyStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, location: &Path, bytes: Bytes) -> Result<PutResult> {
        let _guard = self.enter();
        self.put_hook(location)?;
        self.inner.put(location, bytes).await
    }

    async fn put_opts(&self, location: &Path, bytes: Bytes, opts: PutOptions) -> Result<PutResult> {
        let _guard = self.enter();
        self.put_hook(location)?;
        self.inner.put_opts(location, bytes, opts).await
    }

    async fn put_multipart(
        &self,
        location: &Path,
    ) -> Result<(MultipartId, Box<dyn AsyncWrite + Unpin + Send>)> {
        self.inner.put_multipart(location).await
    }

    async fn abort_multipart(&self, location: &Path, multipart_id: &MultipartId) -> Result<()> {
        self.inner.abort_multipart(location, multipart_id).await
    }

    async fn get(&self, location: &Path) -> Result<GetResult> {
        let _guard = self.enter();
        self.get_hook(location).await?;
        let result = self.inner.get(location).await?;
        self.maybe_corrupt(result).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        let _guard = self.enter();
        self.get_hook(location).await?;
        let result = self.inner.get_opts(location, options).await?;
        self.maybe_corrupt(result).await
    }

    async fn get_range(&self, location: &Path, range: Range<usize>) -> Result<Bytes> {
        self.inner.get_range(location, range).await
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta> {
        self.inner.head(location).await
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Retry quickly so tests that exercise backoff stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn remote_config(max_concurrent_requests: usize) -> RemoteConfig {
    RemoteConfig {
        max_concurrent_requests,
        request_timeout: Duration::from_secs(5),
        retry: fast_retry(3),
    }
}

/// A cache over a fresh [`FaultyStore`] rooted in a temporary directory.
pub struct Harness {
    pub temp_dir: TempDir,
    pub store: Arc<FaultyStore>,
    pub remote: Arc<RemoteStorageClient>,
    pub cache: CacheService,
}

impl Harness {
    pub fn new(max_size_bytes: u64) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FaultyStore::new());
        let remote = Arc::new(RemoteStorageClient::new(store.clone(), &remote_config(8)));
        let cache = CacheService::new(
            cache_config(temp_dir.path().join("cache"), max_size_bytes),
            remote.clone(),
        )
        .unwrap();
        Self {
            temp_dir,
            store,
            remote,
            cache,
        }
    }

    /// A second cache instance over the same directory and store, as after a restart.
    pub fn restart(&self) -> CacheService {
        CacheService::new(self.cache.config().clone(), self.remote.clone()).unwrap()
    }

    pub fn cache_root(&self) -> std::path::PathBuf {
        self.cache.config().cache_dir.clone()
    }

    /// Upload `segments` (key, size) in order and register the resulting manifest.
    pub async fn seed(&self, partition: &PartitionId, segments: &[(&str, usize)]) -> Manifest {
        let manifest = build_manifest(&self.remote, partition, segments).await;
        self.cache.register_manifest(manifest.clone()).await.unwrap();
        self.store.reset_counters();
        manifest
    }
}

pub fn cache_config(cache_dir: std::path::PathBuf, max_size_bytes: u64) -> CacheConfig {
    CacheConfig {
        cache_dir,
        max_size_bytes,
        checksum: ChecksumAlgorithm::Crc32,
        integrity_refetch_attempts: 1,
        remote: remote_config(8),
    }
}

/// Deterministic content for a segment key.
pub fn payload(key: &str, size: usize) -> Bytes {
    let seed = key.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    Bytes::from(
        (0..size)
            .map(|i| seed.wrapping_add(i as u8))
            .collect::<Vec<u8>>(),
    )
}

/// Upload segments under explicit keys. Segment `i` covers `[i * 100, i * 100 + 90)`.
pub async fn build_manifest(
    remote: &RemoteStorageClient,
    partition: &PartitionId,
    segments: &[(&str, usize)],
) -> Manifest {
    let mut manifest = Manifest::new(partition.clone());
    for (i, (key, size)) in segments.iter().enumerate() {
        let data = payload(key, *size);
        remote.put(key, data.clone()).await.unwrap();
        manifest
            .append(SegmentDescriptor {
                base_offset: i as u64 * 100,
                committed_offset: i as u64 * 100 + 90,
                size_bytes: *size as u64,
                checksum: ChecksumAlgorithm::Crc32.compute(&data),
                format_version: 1,
                remote_key: key.to_string(),
            })
            .unwrap();
    }
    manifest
}
