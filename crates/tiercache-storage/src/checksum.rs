//! Content Checksums
//!
//! Segments are verified twice: once when they come back from the object store
//! (against the checksum recorded in the partition manifest) and again on every
//! cache hit (against the checksum recorded when the file was cached).
//!
//! Checksums are rendered as lowercase hex strings so they can be stored in the
//! manifest document and compared without caring about the algorithm.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Checksum algorithm used for segment content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (IEEE), 8 hex characters
    #[default]
    Crc32,
    /// SHA-256, 64 hex characters
    Sha256,
}

impl ChecksumAlgorithm {
    /// Compute the checksum of `data` as a lowercase hex string.
    pub fn compute(&self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Crc32 => format!("{:08x}", crc32fast::hash(data)),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Compare `data` against an expected checksum.
    ///
    /// Returns the computed checksum on mismatch so the caller can report it.
    pub fn verify(&self, data: &[u8], expected: &str) -> std::result::Result<(), String> {
        let actual = self.compute(data);
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(actual)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(ChecksumAlgorithm::Crc32),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(Error::Config(format!("unknown checksum algorithm: {}", other))),
        }
    }
}
