//! Tiered Segment Cache
//!
//! Local disk cache for segments that live in the remote object store. Every cached
//! file is keyed by its remote object key and verified against the checksum recorded
//! in the partition manifest.
//!
//! ## How It Works
//!
//! ```text
//! get("kafka/orders/0/00000000000000000100.seg")
//!         ↓
//! Resident? ──YES──→ read file → checksum ok? ──YES──→ return (hit)
//!     │                               │
//!     NO                              NO → delete file, fall through
//!     ↓
//! Fetch already in flight? ──YES──→ await the shared fetch (join)
//!     │
//!     NO
//!     ↓
//! spawn fetch task:
//!     download → verify against manifest checksum
//!         ↓
//!     write .<name>.<id>.partial → fsync → rename to final name
//!         ↓
//!     register entry, evict LRU until under budget
//! ```
//!
//! ## Key States
//!
//! ```text
//! Absent ──miss──→ Fetching ──ok──→ Resident ──evict──→ Absent
//!                     │                 │
//!                     └──error──→ Absent└──checksum mismatch──→ Absent
//! ```
//!
//! A second miss for a key that is `Fetching` joins the running fetch; there is at
//! most one outstanding remote download per key.
//!
//! ## Eviction
//!
//! Entries are ordered by `(last_access, remote_key)`. After every insertion the
//! least recently used entries are removed until resident bytes fit the budget. The
//! entry that was just inserted is never its own victim, so a single segment larger
//! than the whole budget stays cached on its own.
//!
//! ## Cancellation
//!
//! Fetches run as spawned tasks. Callers waiting on a fetch are reference counted:
//! a caller that gives up only detaches, and the task is aborted only when the last
//! waiter is gone.
//!
//! ## Locking
//!
//! - `inflight` and `state` are short synchronous critical sections, never held
//!   across an await. Lock order is `inflight` then `state`.
//! - `fs_lock` orders filesystem mutations (rename into place, eviction deletes,
//!   invalidation) so a delete for an old entry never removes a newer file.
//! - Renaming a downloaded file into place and registering it run as a separate
//!   task, so aborting the fetch never leaves a final file without an entry.
//! - Hits only touch `state` briefly and read the file without any lock.

use crate::checksum::ChecksumAlgorithm;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::manifest::{manifest_key, Manifest, PartitionId, SegmentDescriptor};
use crate::remote::RemoteStorageClient;
use crate::walker::DirectoryWalker;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tiercache_observability::metrics::{
    CACHE_ENTRIES, CACHE_EVICTIONS_TOTAL, CACHE_FETCH_JOINS_TOTAL, CACHE_HITS_TOTAL,
    CACHE_INTEGRITY_FAILURES_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE_BYTES,
    RECONCILE_REMOVED_TOTAL,
};
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;

const PARTIAL_SUFFIX: &str = ".partial";

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes>>>;

/// A segment resident in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub remote_key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Microseconds since the Unix epoch
    pub last_access: u64,
    pub content_checksum: String,
    /// Distinguishes this entry from later entries for the same key
    generation: u64,
}

/// Byte budget accounting for resident entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionState {
    resident_bytes: u64,
    ceiling: u64,
}

impl EvictionState {
    pub fn new(ceiling: u64) -> Self {
        Self {
            resident_bytes: 0,
            ceiling,
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn is_over_budget(&self) -> bool {
        self.resident_bytes > self.ceiling
    }

    fn charge(&mut self, bytes: u64) {
        self.resident_bytes += bytes;
    }

    fn release(&mut self, bytes: u64) {
        self.resident_bytes = self.resident_bytes.saturating_sub(bytes);
    }
}

/// Observable state of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Fetching,
    Resident,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined an in-flight fetch instead of starting one
    pub fetch_joins: u64,
    pub evictions: u64,
    pub integrity_failures: u64,

    /// Current total size of cached segments
    pub current_size: u64,

    /// Maximum allowed cache size
    pub max_size: u64,

    /// Number of cached segments
    pub entry_count: usize,

    /// Fetches currently running
    pub inflight_fetches: usize,

    /// Cache utilization percentage (0-100)
    pub utilization_pct: f64,
}

/// Outcome of [`CacheService::reconcile_on_startup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Regular files seen by the walk
    pub scanned: usize,
    /// Files kept as resident entries
    pub retained: usize,
    /// Leftover temporary files deleted
    pub removed_partial: usize,
    /// Files for keys no registered manifest knows
    pub removed_orphaned: usize,
    /// Files whose size or checksum disagreed with the manifest
    pub removed_corrupt: usize,
    /// Entries evicted afterwards to fit the budget
    pub evicted: usize,
    /// Paths that could not be inspected
    pub walk_errors: usize,
    /// Resident bytes after reconciliation
    pub resident_bytes: u64,
}

/// Index of resident entries plus their eviction order.
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Eviction order: `(last_access, remote_key)`, oldest first, ties by key.
    lru: BTreeSet<(u64, String)>,
    eviction: EvictionState,
}

impl CacheState {
    fn new(ceiling: u64) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeSet::new(),
            eviction: EvictionState::new(ceiling),
        }
    }

    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let replaced = self.remove(&entry.remote_key);
        self.eviction.charge(entry.size_bytes);
        self.lru
            .insert((entry.last_access, entry.remote_key.clone()));
        self.entries.insert(entry.remote_key.clone(), entry);
        replaced
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru
            .remove(&(entry.last_access, entry.remote_key.clone()));
        self.eviction.release(entry.size_bytes);
        Some(entry)
    }

    /// Remove `key` only if it is still the entry identified by `generation`.
    fn remove_generation(&mut self, key: &str, generation: u64) -> Option<CacheEntry> {
        if self.entries.get(key)?.generation != generation {
            return None;
        }
        self.remove(key)
    }

    fn touch(&mut self, key: &str, now: u64) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&(entry.last_access, key.to_string()));
        entry.last_access = now;
        self.lru.insert((now, key.to_string()));
        Some(entry.clone())
    }

    /// Least recently used key, skipping `protect`.
    fn lru_victim(&self, protect: Option<&str>) -> Option<String> {
        self.lru
            .iter()
            .map(|(_, key)| key)
            .find(|key| Some(key.as_str()) != protect)
            .cloned()
    }

    fn publish(&self) {
        CACHE_SIZE_BYTES.set(self.eviction.resident_bytes as i64);
        CACHE_ENTRIES.set(self.entries.len() as i64);
    }
}

/// Which keys exist remotely, according to the registered manifests.
#[derive(Default)]
struct Catalog {
    manifests: HashMap<PartitionId, Manifest>,
    keys: HashMap<String, SegmentDescriptor>,
}

/// Strictly increasing access stamps in microseconds.
struct AccessClock {
    last: AtomicU64,
}

impl AccessClock {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        let now = unix_micros(SystemTime::now());
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Make sure later ticks sort after `stamp`.
    fn observe(&self, stamp: u64) {
        self.last.fetch_max(stamp, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    evictions: AtomicU64,
    integrity_failures: AtomicU64,
}

struct InFlightFetch {
    id: u64,
    future: SharedFetch,
    waiters: usize,
    abort: AbortHandle,
}

enum Attach {
    /// The key became resident while we were looking
    Resident,
    Waiter(FetchWaiter),
}

/// One caller's interest in an in-flight fetch. Dropping it detaches the caller.
struct FetchWaiter {
    inner: Arc<CacheInner>,
    key: String,
    id: u64,
    future: SharedFetch,
}

impl FetchWaiter {
    async fn wait(self) -> Result<Bytes> {
        self.future.clone().await
    }
}

impl Drop for FetchWaiter {
    fn drop(&mut self) {
        self.inner.detach(&self.key, self.id);
    }
}

/// Temporary file removed on drop unless it was renamed into place.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    async fn remove(mut self) {
        remove_file_quiet(&self.path).await;
        self.persisted = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    remote: Arc<RemoteStorageClient>,
    catalog: RwLock<Catalog>,
    state: Mutex<CacheState>,
    inflight: Mutex<HashMap<String, InFlightFetch>>,
    fs_lock: tokio::sync::Mutex<()>,
    clock: AccessClock,
    counters: Counters,
    next_id: AtomicU64,
    /// Upcoming temp-file writes that fail as if the disk were full
    #[cfg(test)]
    full_disk_writes: std::sync::atomic::AtomicUsize,
}

/// Disk cache in front of the remote object store.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
}

impl CacheService {
    /// Create a cache rooted at `config.cache_dir`.
    ///
    /// The cache starts empty. Call [`register_manifest`](Self::register_manifest) for
    /// every partition and then [`reconcile_on_startup`](Self::reconcile_on_startup)
    /// to adopt files left by a previous run.
    pub fn new(config: CacheConfig, remote: Arc<RemoteStorageClient>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_dir)?;

        let ceiling = config.max_size_bytes;
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                remote,
                catalog: RwLock::new(Catalog::default()),
                state: Mutex::new(CacheState::new(ceiling)),
                inflight: Mutex::new(HashMap::new()),
                fs_lock: tokio::sync::Mutex::new(()),
                clock: AccessClock::new(),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
                #[cfg(test)]
                full_disk_writes: std::sync::atomic::AtomicUsize::new(0),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn remote(&self) -> &Arc<RemoteStorageClient> {
        &self.inner.remote
    }

    /// Install or replace the manifest of a partition.
    ///
    /// Resident entries whose keys were dropped from the manifest (or whose
    /// descriptor changed) are removed. A manifest older than the one already
    /// registered is ignored. Returns the number of invalidated entries.
    pub async fn register_manifest(&self, manifest: Manifest) -> Result<usize> {
        let stale = {
            let mut catalog = write_lock(&self.inner.catalog);

            if let Some(existing) = catalog.manifests.get(&manifest.partition) {
                if existing.revision > manifest.revision {
                    tracing::debug!(
                        partition = %manifest.partition,
                        registered = existing.revision,
                        offered = manifest.revision,
                        "Ignoring older manifest"
                    );
                    return Ok(0);
                }
            }

            let current: HashMap<&str, &SegmentDescriptor> = manifest
                .segments()
                .iter()
                .map(|s| (s.remote_key.as_str(), s))
                .collect();

            let mut stale = Vec::new();
            if let Some(previous) = catalog.manifests.get(&manifest.partition) {
                for segment in previous.segments() {
                    if current.get(segment.remote_key.as_str()) != Some(&segment) {
                        stale.push(segment.remote_key.clone());
                    }
                }
            }
            for key in &stale {
                catalog.keys.remove(key);
            }
            for segment in manifest.segments() {
                catalog
                    .keys
                    .insert(segment.remote_key.clone(), segment.clone());
            }

            tracing::info!(
                partition = %manifest.partition,
                revision = manifest.revision,
                segments = manifest.len(),
                "Registered manifest"
            );
            catalog
                .manifests
                .insert(manifest.partition.clone(), manifest);
            stale
        };

        let mut invalidated = 0;
        for key in stale {
            if self.inner.remove_resident(&key).await? {
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }

    /// Registered manifest of `partition`, if any.
    pub fn manifest(&self, partition: &PartitionId) -> Option<Manifest> {
        read_lock(&self.inner.catalog).manifests.get(partition).cloned()
    }

    /// Partitions with a registered manifest.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = read_lock(&self.inner.catalog)
            .manifests
            .keys()
            .cloned()
            .collect();
        partitions.sort();
        partitions
    }

    /// Bytes of the segment stored under `key`, from disk or from the remote store.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;

        loop {
            if let Some(data) = self.inner.try_hit(key).await? {
                return Ok(data);
            }

            let descriptor = self.inner.descriptor(key)?;
            match CacheInner::attach(&self.inner, key, descriptor) {
                Attach::Resident => continue,
                Attach::Waiter(waiter) => return waiter.wait().await,
            }
        }
    }

    /// Every segment intersecting `range` together with its bytes, in offset order.
    pub async fn read(
        &self,
        partition: &PartitionId,
        range: Range<u64>,
    ) -> Result<Vec<(SegmentDescriptor, Bytes)>> {
        let segments = {
            let catalog = read_lock(&self.inner.catalog);
            let manifest = catalog
                .manifests
                .get(partition)
                .ok_or_else(|| Error::UnknownKey(manifest_key(partition)))?;
            manifest.resolve(range).to_vec()
        };

        let data =
            futures::future::try_join_all(segments.iter().map(|s| self.get(&s.remote_key)))
                .await?;
        Ok(segments.into_iter().zip(data).collect())
    }

    /// Start background fetches for up to `count` segments at or after `from_offset`
    /// that are not cached yet. Returns how many fetches were scheduled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn prefetch(&self, partition: &PartitionId, from_offset: u64, count: usize) -> usize {
        let candidates: Vec<String> = read_lock(&self.inner.catalog)
            .manifests
            .get(partition)
            .map(|m| {
                m.resolve(from_offset..u64::MAX)
                    .iter()
                    .take(count)
                    .map(|s| s.remote_key.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut scheduled = 0;
        for key in candidates {
            if self.key_state(&key) != KeyState::Absent {
                continue;
            }
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.get(&key).await {
                    tracing::debug!(key = %key, error = %e, "Prefetch failed");
                }
            });
            scheduled += 1;
        }

        if scheduled > 0 {
            tracing::debug!(partition = %partition, from_offset, scheduled, "Scheduled prefetch");
        }
        scheduled
    }

    /// Remove `key` from the cache. Returns whether it was resident.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.remove_resident(key).await
    }

    /// Evict least recently used entries until resident bytes fit the budget.
    ///
    /// Returns the number of evicted entries.
    pub async fn evict_if_needed(&self) -> usize {
        let _fs = self.inner.fs_lock.lock().await;
        self.inner
            .evict_locked(None, self.inner.config.max_size_bytes)
            .await
    }

    /// Rebuild the index from the cache directory.
    ///
    /// Deletes leftover temporary files, files for keys no registered manifest
    /// knows, and files whose size or checksum disagrees with the manifest. The
    /// rest becomes resident, ordered by file modification time. Running it twice
    /// in a row changes nothing the second time.
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner.state).entries.contains_key(key)
    }

    pub fn key_state(&self, key: &str) -> KeyState {
        if lock(&self.inner.inflight).contains_key(key) {
            return KeyState::Fetching;
        }
        if self.contains(key) {
            KeyState::Resident
        } else {
            KeyState::Absent
        }
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        lock(&self.inner.state).entries.get(key).cloned()
    }

    /// Resident keys, least recently used first.
    pub fn resident_keys(&self) -> Vec<String> {
        lock(&self.inner.state)
            .lru
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn eviction_state(&self) -> EvictionState {
        lock(&self.inner.state).eviction
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let inflight_fetches = lock(&self.inner.inflight).len();
        let (current_size, entry_count) = {
            let state = lock(&self.inner.state);
            (state.eviction.resident_bytes, state.entries.len())
        };
        let counters = &self.inner.counters;
        let max_size = self.inner.config.max_size_bytes;

        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetch_joins: counters.joins.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            integrity_failures: counters.integrity_failures.load(Ordering::Relaxed),
            current_size,
            max_size,
            entry_count,
            inflight_fetches,
            utilization_pct: current_size as f64 / max_size as f64 * 100.0,
        }
    }
}

impl CacheInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn local_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(key)
    }

    fn descriptor(&self, key: &str) -> Result<SegmentDescriptor> {
        read_lock(&self.catalog)
            .keys
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownKey(key.to_string()))
    }

    fn is_current(&self, key: &str, descriptor: &SegmentDescriptor) -> bool {
        read_lock(&self.catalog).keys.get(key) == Some(descriptor)
    }

    async fn try_hit(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.clock.tick();
        let entry = match lock(&self.state).touch(key, now) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let data = match tokio::fs::read(&entry.local_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(key = %key, "Cached file vanished, treating as miss");
                let mut state = lock(&self.state);
                state.remove_generation(key, entry.generation);
                state.publish();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(actual) = verify_content(
            self.config.checksum,
            &data,
            entry.size_bytes,
            &entry.content_checksum,
        ) {
            self.counters
                .integrity_failures
                .fetch_add(1, Ordering::Relaxed);
            CACHE_INTEGRITY_FAILURES_TOTAL.inc();
            tracing::warn!(
                key = %key,
                expected = %entry.content_checksum,
                actual = %actual,
                "Cached segment failed verification, refetching"
            );

            let _fs = self.fs_lock.lock().await;
            let removed = {
                let mut state = lock(&self.state);
                let removed = state.remove_generation(key, entry.generation);
                state.publish();
                removed
            };
            if removed.is_some() {
                remove_file_quiet(&entry.local_path).await;
            }
            return Ok(None);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS_TOTAL.inc();
        tracing::debug!(key = %key, size = data.len(), "Cache hit");
        Ok(Some(Bytes::from(data)))
    }

    /// Join the fetch for `key` or start one.
    fn attach(this: &Arc<Self>, key: &str, descriptor: SegmentDescriptor) -> Attach {
        let mut inflight = lock(&this.inflight);

        if let Some(fetch) = inflight.get_mut(key) {
            this.count_miss();
            fetch.waiters += 1;
            this.counters.joins.fetch_add(1, Ordering::Relaxed);
            CACHE_FETCH_JOINS_TOTAL.inc();
            tracing::debug!(key = %key, waiters = fetch.waiters, "Joined in-flight fetch");
            return Attach::Waiter(FetchWaiter {
                inner: Arc::clone(this),
                key: key.to_string(),
                id: fetch.id,
                future: fetch.future.clone(),
            });
        }

        // A fetch that finished between our hit check and here has already
        // registered its entry before leaving the in-flight map.
        if lock(&this.state).entries.contains_key(key) {
            return Attach::Resident;
        }

        this.count_miss();
        let id = this.next_id();
        let task = tokio::spawn({
            let inner = Arc::clone(this);
            let key = key.to_string();
            async move {
                let result = inner.fetch_and_store(&key, &descriptor, id).await;
                inner.finish_fetch(&key, id);
                result
            }
        });
        let abort = task.abort_handle();
        let future: SharedFetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Cancelled(e.to_string())),
            }
        }
        .boxed()
        .shared();

        tracing::debug!(key = %key, fetch_id = id, "Cache miss, fetching");
        inflight.insert(
            key.to_string(),
            InFlightFetch {
                id,
                future: future.clone(),
                waiters: 1,
                abort,
            },
        );

        Attach::Waiter(FetchWaiter {
            inner: Arc::clone(this),
            key: key.to_string(),
            id,
            future,
        })
    }

    fn count_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES_TOTAL.inc();
    }

    /// A waiter went away; abort the fetch if nobody is left.
    fn detach(&self, key: &str, id: u64) {
        let mut inflight = lock(&self.inflight);
        let last = match inflight.get_mut(key) {
            Some(fetch) if fetch.id == id => {
                fetch.waiters -= 1;
                fetch.waiters == 0
            }
            _ => return,
        };

        if last {
            if let Some(fetch) = inflight.remove(key) {
                fetch.abort.abort();
                tracing::debug!(key = %key, fetch_id = id, "Last waiter left, fetch cancelled");
            }
        }
    }

    fn finish_fetch(&self, key: &str, id: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(key).map(|f| f.id) == Some(id) {
            inflight.remove(key);
        }
    }

    async fn fetch_and_store(
        self: &Arc<Self>,
        key: &str,
        descriptor: &SegmentDescriptor,
        id: u64,
    ) -> Result<Bytes> {
        let data = self.download_verified(key, descriptor).await?;
        self.store_local(key, descriptor, &data, id).await?;
        Ok(data)
    }

    async fn download_verified(&self, key: &str, descriptor: &SegmentDescriptor) -> Result<Bytes> {
        let attempts = 1 + self.config.integrity_refetch_attempts;
        let mut actual = String::new();

        for attempt in 1..=attempts {
            let data = self.remote.get(key).await?;
            match verify_content(
                self.config.checksum,
                &data,
                descriptor.size_bytes,
                &descriptor.checksum,
            ) {
                Ok(()) => return Ok(data),
                Err(computed) => {
                    self.counters
                        .integrity_failures
                        .fetch_add(1, Ordering::Relaxed);
                    CACHE_INTEGRITY_FAILURES_TOTAL.inc();
                    tracing::warn!(
                        key = %key,
                        attempt,
                        expected = %descriptor.checksum,
                        actual = %computed,
                        "Downloaded segment failed verification"
                    );
                    actual = computed;
                }
            }
        }

        Err(Error::IntegrityMismatch {
            key: key.to_string(),
            expected: descriptor.checksum.clone(),
            actual,
        })
    }

    async fn store_local(
        self: &Arc<Self>,
        key: &str,
        descriptor: &SegmentDescriptor,
        data: &Bytes,
        id: u64,
    ) -> Result<()> {
        let final_path = self.local_path(key);
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.cache_dir.clone());
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("segment");
        let partial = PartialFile::new(dir.join(format!(
            ".{}.{}{}",
            file_name, id, PARTIAL_SUFFIX
        )));

        if let Err(e) = self.write_partial(&partial.path, data).await {
            if !is_storage_full(&e) {
                return Err(e.into());
            }

            tracing::warn!(
                key = %key,
                size = data.len(),
                "Disk full while caching segment, evicting everything else"
            );
            {
                let _fs = self.fs_lock.lock().await;
                self.evict_locked(Some(key), 0).await;
            }

            if let Err(e) = self.write_partial(&partial.path, data).await {
                if is_storage_full(&e) {
                    tracing::error!(key = %key, size = data.len(), "Abandoning fetch, disk still full");
                    return Err(Error::DiskPressure {
                        key: key.to_string(),
                        needed: data.len() as u64,
                    });
                }
                return Err(e.into());
            }
        }

        let commit = tokio::spawn(Arc::clone(self).commit(
            key.to_string(),
            descriptor.clone(),
            partial,
            final_path,
            data.len() as u64,
            id,
        ));
        commit
            .await
            .map_err(|e| Error::Cancelled(e.to_string()))?
    }

    /// Rename a fully written temp file into place, register it and evict.
    async fn commit(
        self: Arc<Self>,
        key: String,
        descriptor: SegmentDescriptor,
        mut partial: PartialFile,
        final_path: PathBuf,
        size_bytes: u64,
        id: u64,
    ) -> Result<()> {
        let _fs = self.fs_lock.lock().await;

        if !self.is_current(&key, &descriptor) {
            tracing::debug!(key = %key, "Segment left the manifest during fetch, not caching");
            partial.remove().await;
            return Ok(());
        }

        tokio::fs::rename(&partial.path, &final_path).await?;
        partial.persisted = true;

        {
            let mut state = lock(&self.state);
            state.insert(CacheEntry {
                remote_key: key.clone(),
                local_path: final_path,
                size_bytes,
                last_access: self.clock.tick(),
                content_checksum: descriptor.checksum.clone(),
                generation: id,
            });
            state.publish();
        }
        tracing::debug!(key = %key, size = size_bytes, "Cached segment");

        self.evict_locked(Some(&key), self.config.max_size_bytes)
            .await;
        Ok(())
    }

    async fn write_partial(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self.take_full_disk_write() {
            tokio::fs::write(path, &data[..data.len() / 2]).await?;
            return Err(io::Error::from(io::ErrorKind::StorageFull));
        }
        write_file(path, data).await
    }

    #[cfg(test)]
    fn take_full_disk_write(&self) -> bool {
        self.full_disk_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn take_full_disk_write(&self) -> bool {
        false
    }

    /// Evict LRU entries until resident bytes are at most `target`.
    ///
    /// Caller holds `fs_lock`. `protect` is never evicted; without it the last
    /// remaining entry is kept even when it alone exceeds the target. Victims
    /// leave the index before their files are deleted; a file left behind by an
    /// interrupted pass is removed by the next reconciliation.
    async fn evict_locked(&self, protect: Option<&str>, target: u64) -> usize {
        let victims = {
            let mut state = lock(&self.state);
            let mut victims = Vec::new();
            while state.eviction.resident_bytes > target {
                if protect.is_none() && state.entries.len() <= 1 {
                    break;
                }
                let Some(victim) = state
                    .lru_victim(protect)
                    .and_then(|key| state.remove(&key))
                else {
                    break;
                };
                victims.push(victim);
            }
            state.publish();

            if state.eviction.resident_bytes > target && target > 0 {
                tracing::warn!(
                    resident = state.eviction.resident_bytes,
                    max_size = target,
                    "Cache over budget: single segment larger than max cache size"
                );
            }
            victims
        };

        for victim in &victims {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            CACHE_EVICTIONS_TOTAL.inc();
            remove_file_quiet(&victim.local_path).await;
            tracing::debug!(
                key = %victim.remote_key,
                size = victim.size_bytes,
                "Evicted from cache"
            );
        }
        victims.len()
    }

    async fn remove_resident(&self, key: &str) -> Result<bool> {
        let _fs = self.fs_lock.lock().await;
        let removed = {
            let mut state = lock(&self.state);
            let removed = state.remove(key);
            state.publish();
            removed
        };

        match removed {
            Some(entry) => {
                match tokio::fs::remove_file(&entry.local_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tracing::debug!(key = %key, "Invalidated cached segment");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let _fs = self.fs_lock.lock().await;

        let walker = DirectoryWalker::new(&self.config.cache_dir);
        let walked = tokio::task::spawn_blocking(move || walker.walk().collect::<Vec<_>>())
            .await
            .map_err(io::Error::other)?;

        let active: HashSet<u64> = lock(&self.inflight).values().map(|f| f.id).collect();
        let previous: HashMap<String, (u64, u64)> = lock(&self.state)
            .entries
            .values()
            .map(|e| (e.remote_key.clone(), (e.last_access, e.generation)))
            .collect();
        let known = read_lock(&self.catalog).keys.clone();

        let mut report = ReconcileReport::default();
        let mut rebuilt = CacheState::new(self.config.max_size_bytes);

        for item in walked {
            let found = match item {
                Ok(found) => found,
                Err(e) => {
                    report.walk_errors += 1;
                    tracing::warn!(path = %e.path.display(), error = %e.source, "Cannot inspect cache path");
                    continue;
                }
            };
            report.scanned += 1;

            let path = self.config.cache_dir.join(&found.relative_path);
            let key = match relative_key(&found.relative_path) {
                Some(key) => key,
                None => {
                    discard(&path, "orphaned").await;
                    report.removed_orphaned += 1;
                    continue;
                }
            };

            if key.ends_with(PARTIAL_SUFFIX) {
                if partial_fetch_id(&key).is_some_and(|id| active.contains(&id)) {
                    continue;
                }
                discard(&path, "partial").await;
                report.removed_partial += 1;
                continue;
            }

            let Some(descriptor) = known.get(&key) else {
                discard(&path, "orphaned").await;
                report.removed_orphaned += 1;
                continue;
            };

            if found.size_bytes != descriptor.size_bytes {
                discard(&path, "corrupt").await;
                report.removed_corrupt += 1;
                continue;
            }

            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    report.walk_errors += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read cached segment");
                    continue;
                }
            };
            if self
                .config
                .checksum
                .verify(&data, &descriptor.checksum)
                .is_err()
            {
                discard(&path, "corrupt").await;
                report.removed_corrupt += 1;
                continue;
            }

            let (last_access, generation) = previous
                .get(&key)
                .copied()
                .unwrap_or_else(|| (unix_micros(found.last_modified), self.next_id()));
            self.clock.observe(last_access);

            rebuilt.insert(CacheEntry {
                remote_key: key,
                local_path: path,
                size_bytes: found.size_bytes,
                last_access,
                content_checksum: descriptor.checksum.clone(),
                generation,
            });
            report.retained += 1;
        }

        {
            let mut state = lock(&self.state);
            *state = rebuilt;
            state.publish();
        }

        report.evicted = self
            .evict_locked(None, self.config.max_size_bytes)
            .await;
        report.resident_bytes = lock(&self.state).eviction.resident_bytes;

        tracing::info!(
            scanned = report.scanned,
            retained = report.retained,
            removed_partial = report.removed_partial,
            removed_orphaned = report.removed_orphaned,
            removed_corrupt = report.removed_corrupt,
            evicted = report.evicted,
            resident_bytes = report.resident_bytes,
            "Reconciled cache directory"
        );
        Ok(report)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(rw: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(rw: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

fn unix_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Check size and checksum; returns the computed checksum on mismatch.
fn verify_content(
    algorithm: ChecksumAlgorithm,
    data: &[u8],
    expected_size: u64,
    expected_checksum: &str,
) -> std::result::Result<(), String> {
    algorithm.verify(data, expected_checksum)?;
    if data.len() as u64 != expected_size {
        return Err(format!("size {} != {}", data.len(), expected_size));
    }
    Ok(())
}

/// Reject keys that cannot live in the cache tree.
fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.ends_with(PARTIAL_SUFFIX)
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Remote key for a path relative to the cache root.
fn relative_key(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Fetch id embedded in a `.<name>.<id>.partial` file name.
fn partial_fetch_id(key: &str) -> Option<u64> {
    let name = key.rsplit('/').next()?;
    let stem = name.strip_suffix(PARTIAL_SUFFIX)?;
    let (_, id) = stem.rsplit_once('.')?;
    id.parse().ok()
}

fn is_storage_full(e: &io::Error) -> bool {
    // ENOSPC
    e.kind() == io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
}

async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_file_quiet(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete cached segment");
        }
    }
}

async fn discard(path: &Path, reason: &'static str) {
    remove_file_quiet(path).await;
    RECONCILE_REMOVED_TOTAL.with_label_values(&[reason]).inc();
    tracing::debug!(path = %path.display(), reason, "Removed cache file");
}
