//! Cache Configuration
//!
//! This module defines the configuration consumed by the tiered-storage cache layer.
//! The surrounding process owns these values; this crate only reads them.
//!
//! ## CacheConfig
//!
//! - **cache_dir**: Root of the local cache tree (default: `./data/cache`)
//! - **max_size_bytes**: Byte budget for resident cache entries (default: 1GB)
//! - **checksum**: Algorithm used for segment checksums (default: crc32)
//! - **integrity_refetch_attempts**: Extra downloads after a remote checksum mismatch (default: 1)
//! - **remote**: Remote client settings (see below)
//!
//! ## RemoteConfig
//!
//! - **max_concurrent_requests**: Global limit of in-flight object-store requests (default: 32)
//! - **request_timeout**: Timeout for a single attempt (default: 30s)
//! - **retry**: Backoff policy for transient failures
//!
//! ## Environment
//!
//! `CacheConfig::from_env()` reads:
//! - `TIERCACHE_CACHE_DIR`
//! - `TIERCACHE_CACHE_SIZE` (bytes)
//! - `TIERCACHE_CHECKSUM` (`crc32` | `sha256`)
//! - `TIERCACHE_REMOTE_CONCURRENCY`
//! - `TIERCACHE_REMOTE_TIMEOUT_MS`
//! - `TIERCACHE_RETRY_ATTEMPTS`
//!
//! ## Usage
//!
//! ```ignore
//! use tiercache_storage::CacheConfig;
//!
//! let config = CacheConfig {
//!     cache_dir: "/var/lib/tiercache".into(),
//!     max_size_bytes: 10 * 1024 * 1024 * 1024, // 10GB
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the cache tree
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Byte budget for resident entries (default: 1GB)
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Checksum algorithm for segment content
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,

    /// Extra downloads after a checksum mismatch on fetched data (default: 1)
    #[serde(default = "default_integrity_refetch_attempts")]
    pub integrity_refetch_attempts: u32,

    /// Remote client settings
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            checksum: ChecksumAlgorithm::default(),
            integrity_refetch_attempts: default_integrity_refetch_attempts(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Maximum simultaneous object-store requests (default: 32)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Timeout applied to each attempt (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout: default_request_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_max_size_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_integrity_refetch_attempts() -> u32 {
    1
}

fn default_max_concurrent_requests() -> usize {
    32
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl CacheConfig {
    /// Build a configuration from `TIERCACHE_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = CacheConfig::default();

        if let Ok(dir) = std::env::var("TIERCACHE_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse::<u64>("TIERCACHE_CACHE_SIZE")? {
            config.max_size_bytes = size;
        }
        if let Ok(algo) = std::env::var("TIERCACHE_CHECKSUM") {
            config.checksum = ChecksumAlgorithm::from_str(&algo)?;
        }
        if let Some(limit) = env_parse::<usize>("TIERCACHE_REMOTE_CONCURRENCY")? {
            config.remote.max_concurrent_requests = limit;
        }
        if let Some(ms) = env_parse::<u64>("TIERCACHE_REMOTE_TIMEOUT_MS")? {
            config.remote.request_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("TIERCACHE_RETRY_ATTEMPTS")? {
            config.remote.retry.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the cache cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Err(Error::Config("max_size_bytes must be greater than 0".into()));
        }
        self.remote.validate()
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "max_concurrent_requests must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
