//! Remote Storage Client
//!
//! Thin, policy-carrying wrapper around an `object_store::ObjectStore` (S3, MinIO,
//! GCS, local filesystem or in-memory). Every request made by the cache layer goes
//! through here so that retry, concurrency limiting and failure classification live
//! in one place.
//!
//! ## Request Flow
//!
//! ```text
//! get("kafka/orders/0/00000000000000000000.seg")
//!     ↓
//! acquire limiter permit   (suspends when max_concurrent_requests are in flight)
//!     ↓
//! object_store GET + body  (bounded by request_timeout)
//!     ↓
//! ┌─ Ok ──────────────→ return bytes
//! ├─ NotFound ────────→ Error::NotFound           (never retried)
//! ├─ 401/403 ─────────→ Error::PermissionDenied   (never retried)
//! ├─ Precondition ────→ Error::PreconditionFailed (never retried)
//! └─ network/5xx/timeout
//!         ↓
//!     release permit, back off with jitter, try again
//!         ↓
//!     attempts exhausted → Error::RemoteUnavailable
//! ```
//!
//! ## Idempotency
//!
//! `put` overwrites the object at its key, so re-uploading the same content after an
//! ambiguous failure is harmless. Conditional writes (`put_conditional`) are the
//! compare-and-swap primitive the manifest store builds on: a retried conditional
//! write that already landed reports `PreconditionFailed`, which the caller treats as
//! a conflict and resolves by reloading.

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiercache_observability::metrics::{
    REMOTE_ERRORS_TOTAL, REMOTE_LATENCY, REMOTE_REQUESTS_TOTAL, REMOTE_RETRIES_TOTAL,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Opaque version token of a remote object, used for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectVersion {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl From<ObjectVersion> for UpdateVersion {
    fn from(v: ObjectVersion) -> Self {
        UpdateVersion {
            e_tag: v.e_tag,
            version: v.version,
        }
    }
}

/// Object payload together with the version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedObject {
    pub data: Bytes,
    pub version: ObjectVersion,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// The object must not exist yet
    Create,
    /// The object must still be at this version
    Matches(ObjectVersion),
}

/// How a failed attempt should be handled.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Worth another attempt (network, 5xx, throttling, timeout)
    Transient(String),
    /// Surface immediately
    Fatal(Error),
}

impl Failure {
    fn kind(&self) -> &'static str {
        match self {
            Failure::Transient(_) => "transient",
            Failure::Fatal(Error::NotFound(_)) => "not_found",
            Failure::Fatal(Error::PermissionDenied { .. }) => "permission",
            Failure::Fatal(Error::PreconditionFailed(_)) => "precondition",
            Failure::Fatal(_) => "fatal",
        }
    }
}

const AUTH_SIGNALS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "accessdenied",
    "access denied",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "expiredtoken",
];

/// Sort an object-store error into the retry taxonomy.
pub(crate) fn classify(err: object_store::Error, key: &str) -> Failure {
    match err {
        object_store::Error::NotFound { .. } => Failure::Fatal(Error::NotFound(key.to_string())),
        object_store::Error::Precondition { .. } | object_store::Error::AlreadyExists { .. } => {
            Failure::Fatal(Error::PreconditionFailed(key.to_string()))
        }
        e @ (object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::UnknownConfigurationKey { .. }
        | object_store::Error::NotModified { .. }) => Failure::Fatal(Error::from(e)),
        e => {
            let message = e.to_string();
            let lowered = message.to_ascii_lowercase();
            if AUTH_SIGNALS.iter().any(|signal| lowered.contains(signal)) {
                Failure::Fatal(Error::PermissionDenied {
                    key: key.to_string(),
                    message,
                })
            } else {
                Failure::Transient(message)
            }
        }
    }
}

/// Client for the remote object store.
///
/// Cheap to share behind an `Arc`; the concurrency limit is global to the instance.
pub struct RemoteStorageClient {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
    max_concurrent_requests: usize,
    request_timeout: Duration,
}

impl RemoteStorageClient {
    pub fn new(store: Arc<dyn ObjectStore>, config: &RemoteConfig) -> Self {
        let max_concurrent_requests = config.max_concurrent_requests.max(1);
        Self {
            store,
            policy: config.retry.clone(),
            limiter: Arc::new(Semaphore::new(max_concurrent_requests)),
            max_concurrent_requests,
            request_timeout: config.request_timeout,
        }
    }

    /// Client with default settings.
    pub fn with_defaults(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(store, &RemoteConfig::default())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of requests that could start right now without waiting.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Upload `data` to `key`, overwriting whatever is there.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = Path::from(key);
        let store = &self.store;
        let path_ref = &path;
        self.execute("put", key, move || {
            let data = data.clone();
            async move { store.put(path_ref, data).await }
        })
        .await?;

        tracing::debug!(key = %key, "Uploaded object");
        Ok(())
    }

    /// Upload `data` to `key` only if `condition` holds on the remote side.
    ///
    /// Returns the version of the newly written object.
    pub async fn put_conditional(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> Result<ObjectVersion> {
        let path = Path::from(key);
        let store = &self.store;
        let path_ref = &path;
        let mode = match condition {
            PutCondition::Create => PutMode::Create,
            PutCondition::Matches(version) => PutMode::Update(version.into()),
        };

        let result = self
            .execute("put_conditional", key, move || {
                let data = data.clone();
                let opts = PutOptions::from(mode.clone());
                async move { store.put_opts(path_ref, data, opts).await }
            })
            .await?;

        Ok(ObjectVersion {
            e_tag: result.e_tag,
            version: result.version,
        })
    }

    /// Download the object at `key`.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(self.get_versioned(key).await?.data)
    }

    /// Download the object at `key` together with its version token.
    pub async fn get_versioned(&self, key: &str) -> Result<VersionedObject> {
        let path = Path::from(key);
        let store = &self.store;
        let path_ref = &path;

        let object = self
            .execute("get", key, move || async move {
                let result = store.get(path_ref).await?;
                let version = ObjectVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let data = result.bytes().await?;
                Ok(VersionedObject { data, version })
            })
            .await?;

        tracing::debug!(key = %key, size = object.data.len(), "Downloaded object");
        Ok(object)
    }

    /// Delete the object at `key`.
    ///
    /// Most object stores treat deleting a missing key as success, so the object is
    /// probed first and a missing object is reported as `Error::NotFound`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        let store = &self.store;
        let path_ref = &path;

        self.execute("head", key, move || async move { store.head(path_ref).await })
            .await?;
        self.execute("delete", key, move || async move { store.delete(path_ref).await })
            .await?;

        tracing::debug!(key = %key, "Deleted object");
        Ok(())
    }

    /// Lazily list every key under `prefix`.
    ///
    /// The listing holds one limiter permit for as long as the stream is alive.
    /// Errors are surfaced per item and are not retried mid-stream.
    pub fn list(&self, prefix: &str) -> BoxStream<'_, Result<String>> {
        let prefix_path = if prefix.is_empty() {
            None
        } else {
            Some(Path::from(prefix))
        };
        let listing = self.store.list(prefix_path.as_ref());
        let limiter = Arc::clone(&self.limiter);
        let prefix = prefix.to_string();

        REMOTE_REQUESTS_TOTAL.with_label_values(&["list"]).inc();

        Box::pin(futures::stream::unfold(
            (listing, limiter, None::<OwnedSemaphorePermit>, prefix),
            |(mut listing, limiter, permit, prefix)| async move {
                let permit = match permit {
                    Some(p) => p,
                    None => limiter.clone().acquire_owned().await.ok()?,
                };
                let item = match listing.next().await? {
                    Ok(meta) => Ok(meta.location.to_string()),
                    Err(e) => {
                        let failure = classify(e, &prefix);
                        REMOTE_ERRORS_TOTAL
                            .with_label_values(&["list", failure.kind()])
                            .inc();
                        Err(match failure {
                            Failure::Transient(message) => Error::RemoteUnavailable {
                                key: prefix.clone(),
                                attempts: 1,
                                message,
                            },
                            Failure::Fatal(err) => err,
                        })
                    }
                };
                Some((item, (listing, limiter, Some(permit), prefix)))
            },
        ))
    }

    /// Run one remote operation under the limiter with timeout, classification
    /// and bounded retries.
    async fn execute<T, F, Fut>(&self, op: &'static str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let outcome = {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled("remote request limiter closed".into()))?;

                REMOTE_REQUESTS_TOTAL.with_label_values(&[op]).inc();
                let start = Instant::now();
                let outcome = tokio::time::timeout(self.request_timeout, call()).await;
                REMOTE_LATENCY
                    .with_label_values(&[op])
                    .observe(start.elapsed().as_secs_f64());
                outcome
            };

            let failure = match outcome {
                Ok(Ok(value)) => {
                    if attempts > 1 {
                        tracing::debug!(op, key = %key, attempts, "Remote request succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => classify(e, key),
                Err(_) => Failure::Transient(format!(
                    "attempt timed out after {}ms",
                    self.request_timeout.as_millis()
                )),
            };

            REMOTE_ERRORS_TOTAL
                .with_label_values(&[op, failure.kind()])
                .inc();

            match failure {
                Failure::Fatal(err) => {
                    tracing::debug!(op, key = %key, error = %err, "Remote request failed, not retrying");
                    return Err(err);
                }
                Failure::Transient(message) => {
                    if !self.policy.should_retry(attempts) {
                        tracing::error!(
                            op,
                            key = %key,
                            attempts,
                            error = %message,
                            "Remote request failed after all retries"
                        );
                        return Err(Error::RemoteUnavailable {
                            key: key.to_string(),
                            attempts,
                            message,
                        });
                    }

                    let backoff = self.policy.jittered_backoff(attempts - 1);
                    REMOTE_RETRIES_TOTAL.with_label_values(&[op]).inc();
                    tracing::warn!(
                        op,
                        key = %key,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "Remote request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
