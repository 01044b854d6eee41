//! Storage Error Types
//!
//! This module defines all error types that can occur in the tiered-storage cache layer.
//!
//! ## Error Categories
//!
//! ### Remote Errors
//! - `RemoteUnavailable`: Transient network/5xx failures that survived every retry
//! - `NotFound`: The remote object does not exist (never retried)
//! - `PermissionDenied`: Auth/permission failure (never retried, fatal to the caller)
//! - `PreconditionFailed`: A conditional write lost its compare-and-swap
//!
//! ### Manifest Errors
//! - `ManifestConflict`: The remote manifest revision advanced since it was loaded
//! - `ManifestFormat`: The manifest document is corrupt or misses required fields
//! - `OrderingViolation`: An appended segment overlaps the already tiered range
//!
//! ### Cache Errors
//! - `IntegrityMismatch`: Checksum failure on cached or downloaded data
//! - `DiskPressure`: The local disk could not hold the fetched object
//! - `UnknownKey` / `InvalidKey`: The key is not indexed or cannot live in the cache tree
//!
//! ## Cloning
//!
//! `Error` is `Clone` so a single fetch outcome can be handed to every caller
//! waiting on the same in-flight download. Non-clonable sources are kept behind `Arc`.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Remote storage unavailable for {key} after {attempts} attempts: {message}")]
    RemoteUnavailable {
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied for {key}: {message}")]
    PermissionDenied { key: String, message: String },

    #[error("Conditional write rejected: {0}")]
    PreconditionFailed(String),

    #[error("Integrity mismatch for {key}: expected checksum {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error(
        "Manifest conflict for {partition}: expected revision {expected_revision}, found {found_revision:?}"
    )]
    ManifestConflict {
        partition: String,
        expected_revision: u64,
        found_revision: Option<u64>,
    },

    #[error("Manifest format error: {0}")]
    ManifestFormat(String),

    #[error(
        "Segment ordering violation: base offset {base_offset} falls inside tiered range ending at {last_committed}"
    )]
    OrderingViolation { base_offset: u64, last_committed: u64 },

    #[error("Disk pressure: cannot store {needed} bytes for {key}")]
    DiskPressure { key: String, needed: u64 },

    #[error("Key is not indexed by any manifest: {0}")]
    UnknownKey(String),

    #[error("Key cannot be mapped into the cache directory: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Object store error: {0}")]
    ObjectStore(Arc<object_store::Error>),

    #[error("Fetch cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the condition may clear up if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable { .. }
                | Error::ManifestConflict { .. }
                | Error::IntegrityMismatch { .. }
                | Error::Cancelled(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ManifestFormat(e.to_string())
    }
}
