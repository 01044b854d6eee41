//! Partition Manifests
//!
//! A manifest is the authoritative index of which segments of a partition live in
//! the remote object store, and at which offsets.
//!
//! ## Document
//!
//! ```text
//! {ns}/{topic}/{partition}/manifest.json
//! {
//!   "partition": { "namespace": "kafka", "topic": "orders", "partition": 0 },
//!   "revision": 7,
//!   "segments": [
//!     { "base_offset": 0,   "committed_offset": 100, "size_bytes": 4096, ... },
//!     { "base_offset": 100, "committed_offset": 250, "size_bytes": 8192, ... }
//!   ]
//! }
//! ```
//!
//! Segments cover half-open offset ranges `[base_offset, committed_offset)`, are kept
//! sorted by `base_offset` and never overlap. Unknown fields are ignored on read;
//! missing fields or an ordering violation make the whole document unreadable.
//!
//! ## Remote Keys
//!
//! ```text
//! {ns}/{topic}/{partition}/{base_offset:020}.seg
//! ```
//!
//! The key depends only on the partition and the base offset, so it never changes
//! across manifest revisions.
//!
//! ## Optimistic Concurrency
//!
//! [`ManifestStore::store`] is a compare-and-swap: it writes `revision + 1` only if
//! the remote document is still at the revision the caller loaded. Otherwise the
//! caller gets `Error::ManifestConflict` and must reload, re-apply its mutation and
//! store again. Nothing is merged here.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::remote::{PutCondition, RemoteStorageClient};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tiercache_observability::metrics::MANIFEST_CONFLICTS_TOTAL;

const MANIFEST_FILE: &str = "manifest.json";

/// Identity of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl PartitionId {
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: u32) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Parse the partition out of a `{ns}/{topic}/{partition}/manifest.json` key.
    pub fn from_manifest_key(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(4, '/');
        if parts.next()? != MANIFEST_FILE {
            return None;
        }
        let partition = parts.next()?.parse().ok()?;
        let topic = parts.next()?;
        let namespace = parts.next()?;
        if namespace.is_empty() || topic.is_empty() {
            return None;
        }
        Some(Self::new(namespace, topic, partition))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

/// Remote key for the segment of `partition` starting at `base_offset`.
pub fn segment_key(partition: &PartitionId, base_offset: u64) -> String {
    format!("{}/{:020}.seg", partition, base_offset)
}

/// Remote key of the manifest document of `partition`.
pub fn manifest_key(partition: &PartitionId) -> String {
    format!("{}/{}", partition, MANIFEST_FILE)
}

/// One tiered segment. Immutable once it is part of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// First offset in the segment
    pub base_offset: u64,
    /// One past the last offset in the segment
    pub committed_offset: u64,
    /// Size of the remote object
    pub size_bytes: u64,
    /// Lowercase hex checksum of the remote object
    pub checksum: String,
    /// Segment encoding version
    pub format_version: u32,
    /// Object key in the remote store
    pub remote_key: String,
}

impl SegmentDescriptor {
    /// Offsets covered by this segment.
    pub fn offsets(&self) -> Range<u64> {
        self.base_offset..self.committed_offset
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.offsets().contains(&offset)
    }

    fn overlaps(&self, range: &Range<u64>) -> bool {
        self.base_offset < range.end && range.start < self.committed_offset
    }
}

/// Index of the remote segments of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub partition: PartitionId,
    pub revision: u64,
    segments: Vec<SegmentDescriptor>,
}

impl Manifest {
    /// Empty manifest at revision 0.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            revision: 0,
            segments: Vec::new(),
        }
    }

    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// End of the tiered range (exclusive), if anything is tiered.
    pub fn last_committed_offset(&self) -> Option<u64> {
        self.segments.last().map(|s| s.committed_offset)
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    pub fn segment_by_key(&self, remote_key: &str) -> Option<&SegmentDescriptor> {
        self.segments.iter().find(|s| s.remote_key == remote_key)
    }

    /// Segments intersecting `range`, in increasing `base_offset` order.
    ///
    /// A range outside everything tiered yields an empty slice.
    pub fn resolve(&self, range: Range<u64>) -> &[SegmentDescriptor] {
        if range.start >= range.end {
            return &[];
        }

        // First segment that ends after the range starts
        let start = self
            .segments
            .partition_point(|s| s.committed_offset <= range.start);
        let end = start
            + self.segments[start..]
                .iter()
                .take_while(|s| s.overlaps(&range))
                .count();

        &self.segments[start..end]
    }

    /// Check whether a segment `[base_offset, committed_offset)` may be appended.
    ///
    /// A new segment must start strictly after the current tiered end; starting
    /// exactly at it is rejected too.
    pub fn check_append(&self, base_offset: u64, committed_offset: u64) -> Result<()> {
        if committed_offset <= base_offset {
            return Err(Error::OrderingViolation {
                base_offset,
                last_committed: committed_offset,
            });
        }
        if let Some(last_committed) = self.last_committed_offset() {
            if base_offset <= last_committed {
                return Err(Error::OrderingViolation {
                    base_offset,
                    last_committed,
                });
            }
        }
        Ok(())
    }

    /// Append a newly tiered segment.
    ///
    /// On error the manifest is left untouched.
    pub fn append(&mut self, descriptor: SegmentDescriptor) -> Result<()> {
        self.check_append(descriptor.base_offset, descriptor.committed_offset)?;
        self.segments.push(descriptor);
        Ok(())
    }

    /// Drop every segment that ends at or before `retain_from`.
    ///
    /// Returns the removed descriptors, oldest first.
    pub fn prune(&mut self, retain_from: u64) -> Vec<SegmentDescriptor> {
        let cut = self
            .segments
            .partition_point(|s| s.committed_offset <= retain_from);
        self.segments.drain(..cut).collect()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest document, re-checking the ordering invariant.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut previous: Option<&SegmentDescriptor> = None;
        for segment in &self.segments {
            if segment.committed_offset <= segment.base_offset {
                return Err(Error::ManifestFormat(format!(
                    "segment {} has empty range [{}, {})",
                    segment.remote_key, segment.base_offset, segment.committed_offset
                )));
            }
            if let Some(prev) = previous {
                if segment.base_offset < prev.committed_offset {
                    return Err(Error::ManifestFormat(format!(
                        "segment {} at {} overlaps {} ending at {}",
                        segment.remote_key,
                        segment.base_offset,
                        prev.remote_key,
                        prev.committed_offset
                    )));
                }
            }
            previous = Some(segment);
        }
        Ok(())
    }
}

/// Loads and stores manifests through the remote client.
pub struct ManifestStore {
    remote: Arc<RemoteStorageClient>,
    checksum: ChecksumAlgorithm,
}

impl ManifestStore {
    pub fn new(remote: Arc<RemoteStorageClient>) -> Self {
        Self::with_checksum(remote, ChecksumAlgorithm::default())
    }

    pub fn with_checksum(remote: Arc<RemoteStorageClient>, checksum: ChecksumAlgorithm) -> Self {
        Self { remote, checksum }
    }

    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Load the manifest of `partition`; an absent document is an empty manifest.
    pub async fn load(&self, partition: &PartitionId) -> Result<Manifest> {
        let key = manifest_key(partition);
        let data = match self.remote.get(&key).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => {
                tracing::debug!(partition = %partition, "No remote manifest, starting empty");
                return Ok(Manifest::new(partition.clone()));
            }
            Err(e) => return Err(e),
        };

        let manifest = Manifest::deserialize(&data)?;
        if &manifest.partition != partition {
            return Err(Error::ManifestFormat(format!(
                "{} holds the manifest of {}",
                key, manifest.partition
            )));
        }

        tracing::debug!(
            partition = %partition,
            revision = manifest.revision,
            segments = manifest.len(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    /// Persist `manifest` if the remote copy is still at `manifest.revision`.
    ///
    /// On success `manifest.revision` is advanced to the stored revision. On
    /// `Error::ManifestConflict` the manifest is unchanged and the caller must reload.
    pub async fn store(&self, manifest: &mut Manifest) -> Result<()> {
        let key = manifest_key(&manifest.partition);
        let partition = manifest.partition.to_string();

        let current = match self.remote.get_versioned(&key).await {
            Ok(object) => Some((Manifest::deserialize(&object.data)?.revision, object.version)),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let found_revision = current.as_ref().map(|(revision, _)| *revision);
        if found_revision.unwrap_or(0) != manifest.revision {
            return Err(self.conflict(&partition, manifest.revision, found_revision));
        }

        let mut next = manifest.clone();
        next.revision += 1;
        let body = Bytes::from(next.serialize()?);

        let condition = match current {
            Some((_, version)) => PutCondition::Matches(version),
            None => PutCondition::Create,
        };

        match self.remote.put_conditional(&key, body.clone(), condition).await {
            Ok(_) => {}
            Err(Error::PreconditionFailed(_)) => {
                // Someone stored between our read and our write
                return Err(self.conflict(&partition, manifest.revision, None));
            }
            Err(Error::ObjectStore(e)) if matches!(*e, object_store::Error::NotImplemented) => {
                tracing::warn!(
                    partition = %partition,
                    "Object store lacks conditional updates, relying on revision check only"
                );
                self.remote.put(&key, body).await?;
            }
            Err(e) => return Err(e),
        }

        manifest.revision = next.revision;
        tracing::info!(
            partition = %partition,
            revision = manifest.revision,
            segments = manifest.len(),
            "Stored manifest"
        );
        Ok(())
    }

    /// Upload one segment and append its descriptor to `manifest`.
    ///
    /// The manifest still has to be stored afterwards. Uploading is idempotent, so a
    /// caller that loses a store conflict can reload and call this again.
    pub async fn upload_segment(
        &self,
        manifest: &mut Manifest,
        base_offset: u64,
        committed_offset: u64,
        data: Bytes,
        format_version: u32,
    ) -> Result<SegmentDescriptor> {
        manifest.check_append(base_offset, committed_offset)?;

        let remote_key = segment_key(&manifest.partition, base_offset);
        let descriptor = SegmentDescriptor {
            base_offset,
            committed_offset,
            size_bytes: data.len() as u64,
            checksum: self.checksum.compute(&data),
            format_version,
            remote_key,
        };

        self.remote.put(&descriptor.remote_key, data).await?;
        manifest.append(descriptor.clone())?;

        tracing::info!(
            partition = %manifest.partition,
            key = %descriptor.remote_key,
            base_offset,
            committed_offset,
            size = descriptor.size_bytes,
            "Tiered segment"
        );
        Ok(descriptor)
    }

    /// Delete the remote objects of segments removed by [`Manifest::prune`].
    ///
    /// Objects that are already gone are skipped. Call this only after the pruned
    /// manifest has been stored.
    pub async fn delete_segments(&self, removed: &[SegmentDescriptor]) -> Result<usize> {
        let mut deleted = 0;
        for segment in removed {
            match self.remote.delete(&segment.remote_key).await {
                Ok(()) => deleted += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Find every partition with a manifest under `prefix`.
    pub async fn discover(&self, prefix: &str) -> Result<Vec<PartitionId>> {
        let mut listing = self.remote.list(prefix);
        let mut partitions = Vec::new();
        while let Some(key) = listing.next().await {
            if let Some(partition) = PartitionId::from_manifest_key(&key?) {
                partitions.push(partition);
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    fn conflict(&self, partition: &str, expected: u64, found: Option<u64>) -> Error {
        MANIFEST_CONFLICTS_TOTAL.inc();
        tracing::warn!(
            partition = %partition,
            expected_revision = expected,
            found_revision = ?found,
            "Manifest conflict"
        );
        Error::ManifestConflict {
            partition: partition.to_string(),
            expected_revision: expected,
            found_revision: found,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn partition() -> PartitionId {
        PartitionId::new("kafka", "orders", 0)
    }

    fn descriptor(base: u64, committed: u64, key: &str) -> SegmentDescriptor {
        SegmentDescriptor {
            base_offset: base,
            committed_offset: committed,
            size_bytes: (committed - base) * 10,
            checksum: format!("{:08x}", base),
            format_version: 1,
            remote_key: key.to_string(),
        }
    }

    /// Back-to-back segments, as a stored document may hold them.
    fn sample() -> Manifest {
        let doc = serde_json::json!({
            "partition": partition(),
            "revision": 0,
            "segments": [descriptor(0, 100, "seg-0"), descriptor(100, 250, "seg-1")],
        });
        Manifest::deserialize(&serde_json::to_vec(&doc).unwrap()).unwrap()
    }

    fn store() -> ManifestStore {
        ManifestStore::new(Arc::new(RemoteStorageClient::with_defaults(Arc::new(
            InMemory::new(),
        ))))
    }

    #[test]
    fn test_key_scheme() {
        let p = partition();
        assert_eq!(segment_key(&p, 42), "kafka/orders/0/00000000000000000042.seg");
        assert_eq!(manifest_key(&p), "kafka/orders/0/manifest.json");
        assert_eq!(PartitionId::from_manifest_key(&manifest_key(&p)), Some(p));
        assert_eq!(PartitionId::from_manifest_key("kafka/orders/0/x.seg"), None);
        assert_eq!(PartitionId::from_manifest_key("orders/0/manifest.json"), None);
    }

    #[test]
    fn test_resolve_spanning_range() {
        let manifest = sample();
        let keys: Vec<_> = manifest
            .resolve(50..150)
            .iter()
            .map(|s| s.remote_key.as_str())
            .collect();
        assert_eq!(keys, vec!["seg-0", "seg-1"]);
    }

    #[test]
    fn test_resolve_edges() {
        let manifest = sample();
        assert_eq!(manifest.resolve(0..1)[0].remote_key, "seg-0");
        assert_eq!(manifest.resolve(99..100).len(), 1);
        assert_eq!(manifest.resolve(100..101)[0].remote_key, "seg-1");
        assert_eq!(manifest.resolve(0..1000).len(), 2);

        // Not yet tiered
        assert!(manifest.resolve(250..400).is_empty());
        // Empty request
        assert!(manifest.resolve(60..60).is_empty());
        assert!(Manifest::new(partition()).resolve(0..10).is_empty());
    }

    #[test]
    fn test_resolve_gap_between_segments() {
        let mut manifest = Manifest::new(partition());
        manifest.append(descriptor(0, 10, "a")).unwrap();
        manifest.append(descriptor(20, 30, "b")).unwrap();
        assert!(manifest.resolve(12..18).is_empty());
        assert_eq!(manifest.resolve(5..25).len(), 2);
    }

    #[test]
    fn test_append_ordering_violation_leaves_state() {
        let mut manifest = sample();
        let before = manifest.clone();

        let err = manifest.append(descriptor(200, 300, "overlap")).unwrap_err();
        assert!(matches!(
            err,
            Error::OrderingViolation {
                base_offset: 200,
                last_committed: 250
            }
        ));
        assert!(manifest.append(descriptor(0, 10, "rewind")).is_err());
        assert!(manifest.append(descriptor(300, 300, "empty")).is_err());
        assert_eq!(manifest, before);

        manifest.append(descriptor(251, 260, "next")).unwrap();
        assert_eq!(manifest.last_committed_offset(), Some(260));
    }

    #[test]
    fn test_append_at_tiered_end_is_rejected() {
        let mut manifest = Manifest::new(partition());
        manifest.append(descriptor(0, 100, "seg-0")).unwrap();
        let before = manifest.clone();

        let err = manifest.append(descriptor(100, 250, "seg-1")).unwrap_err();
        assert!(matches!(
            err,
            Error::OrderingViolation {
                base_offset: 100,
                last_committed: 100
            }
        ));
        assert_eq!(manifest, before);
        assert!(manifest.check_append(100, 250).is_err());
        assert!(manifest.check_append(101, 250).is_ok());
    }

    #[test]
    fn test_prune() {
        let mut manifest = sample();
        manifest.append(descriptor(260, 400, "seg-2")).unwrap();

        assert!(manifest.prune(50).is_empty());

        let removed = manifest.prune(250);
        let keys: Vec<_> = removed.iter().map(|s| s.remote_key.as_str()).collect();
        assert_eq!(keys, vec!["seg-0", "seg-1"]);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.segments()[0].remote_key, "seg-2");
    }

    #[test]
    fn test_serialize_roundtrip_keeps_revision() {
        let mut manifest = sample();
        manifest.revision = 17;
        let decoded = Manifest::deserialize(&manifest.serialize().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.revision, 17);
    }

    #[test]
    fn test_deserialize_ignores_unknown_fields() {
        let json = r#"{
            "partition": {"namespace": "kafka", "topic": "orders", "partition": 0, "region": "eu"},
            "revision": 3,
            "writer": "tiering-controller-2",
            "segments": [
                {"base_offset": 0, "committed_offset": 10, "size_bytes": 5, "checksum": "abc",
                 "format_version": 2, "remote_key": "k", "compression": "lz4"}
            ]
        }"#;
        let manifest = Manifest::deserialize(json.as_bytes()).unwrap();
        assert_eq!(manifest.revision, 3);
        assert_eq!(manifest.segments()[0].format_version, 2);
    }

    #[test]
    fn test_deserialize_rejects_missing_fields_and_bad_order() {
        let missing = r#"{"partition": {"namespace": "a", "topic": "b", "partition": 0},
            "revision": 1,
            "segments": [{"base_offset": 0, "committed_offset": 10, "size_bytes": 5,
                          "format_version": 1, "remote_key": "k"}]}"#;
        assert!(matches!(
            Manifest::deserialize(missing.as_bytes()),
            Err(Error::ManifestFormat(_))
        ));

        let overlapping = r#"{"partition": {"namespace": "a", "topic": "b", "partition": 0},
            "revision": 1,
            "segments": [
              {"base_offset": 0, "committed_offset": 10, "size_bytes": 5, "checksum": "x", "format_version": 1, "remote_key": "k0"},
              {"base_offset": 5, "committed_offset": 20, "size_bytes": 5, "checksum": "y", "format_version": 1, "remote_key": "k1"}
            ]}"#;
        assert!(matches!(
            Manifest::deserialize(overlapping.as_bytes()),
            Err(Error::ManifestFormat(_))
        ));

        assert!(matches!(
            Manifest::deserialize(b"not json"),
            Err(Error::ManifestFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_load_absent_is_empty() {
        let store = store();
        let manifest = store.load(&partition()).await.unwrap();
        assert_eq!(manifest, Manifest::new(partition()));
    }

    #[tokio::test]
    async fn test_store_and_reload() {
        let store = store();
        let mut manifest = store.load(&partition()).await.unwrap();
        store
            .upload_segment(&mut manifest, 0, 100, Bytes::from(vec![7u8; 64]), 1)
            .await
            .unwrap();
        store.store(&mut manifest).await.unwrap();
        assert_eq!(manifest.revision, 1);

        let loaded = store.load(&partition()).await.unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(
            loaded.segments()[0].checksum,
            ChecksumAlgorithm::Crc32.compute(&[7u8; 64])
        );

        let mut again = loaded.clone();
        store
            .upload_segment(&mut again, 101, 200, Bytes::from_static(b"next"), 1)
            .await
            .unwrap();
        store.store(&mut again).await.unwrap();
        assert_eq!(again.revision, 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict() {
        let store = store();
        let mut seed = store.load(&partition()).await.unwrap();
        store.store(&mut seed).await.unwrap();

        let mut first = store.load(&partition()).await.unwrap();
        let mut second = store.load(&partition()).await.unwrap();

        first.append(descriptor(0, 10, "first")).unwrap();
        second.append(descriptor(0, 20, "second")).unwrap();

        store.store(&mut first).await.unwrap();
        let before = second.clone();
        let err = store.store(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ManifestConflict {
                expected_revision: 1,
                found_revision: Some(2),
                ..
            }
        ));
        assert_eq!(second, before);

        let remote = store.load(&partition()).await.unwrap();
        assert_eq!(remote.segments()[0].remote_key, "first");
    }

    #[tokio::test]
    async fn test_discover_and_delete_pruned() {
        let store = store();
        for p in [
            PartitionId::new("kafka", "orders", 1),
            PartitionId::new("kafka", "orders", 0),
        ] {
            let mut manifest = store.load(&p).await.unwrap();
            store
                .upload_segment(&mut manifest, 0, 10, Bytes::from_static(b"x"), 1)
                .await
                .unwrap();
            store.store(&mut manifest).await.unwrap();
        }

        let found = store.discover("kafka").await.unwrap();
        assert_eq!(
            found,
            vec![
                PartitionId::new("kafka", "orders", 0),
                PartitionId::new("kafka", "orders", 1)
            ]
        );

        let mut manifest = store.load(&found[0]).await.unwrap();
        let removed = manifest.prune(10);
        store.store(&mut manifest).await.unwrap();
        assert_eq!(store.delete_segments(&removed).await.unwrap(), 1);
        assert_eq!(store.delete_segments(&removed).await.unwrap(), 0);
    }
}
