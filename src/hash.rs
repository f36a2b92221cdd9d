// src/hash.rs

//! Checksum algorithms used by Debian archive metadata
//!
//! Release and Packages files list up to three digests per file:
//! - **SHA-256**: preferred whenever present
//! - **SHA-1**: legacy, still emitted by many mirrors
//! - **MD5**: oldest and weakest, used only when nothing else is listed
//!
//! # Field names
//!
//! | Algorithm | Release field | Packages field |
//! |-----------|---------------|----------------|
//! | SHA-256 | `SHA256` (or `SHA256Sum`) | `SHA256` |
//! | SHA-1 | `SHA1` (or `SHA1Sum`) | `SHA1` |
//! | MD5 | `MD5Sum` | `MD5sum` |

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit)
    Sha256,
    /// SHA-1 (160-bit)
    Sha1,
    /// MD5 (128-bit)
    Md5,
}

impl HashAlgorithm {
    /// All algorithms, strongest first
    pub const PREFERENCE: [HashAlgorithm; 3] = [Self::Sha256, Self::Sha1, Self::Md5];

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
        }
    }

    /// Map a metadata field name to its algorithm
    ///
    /// Matching is case-insensitive, so both the Release (`MD5Sum`) and the
    /// Packages (`MD5sum`) spellings are accepted.
    pub fn from_field(field: &str) -> Option<Self> {
        match field.to_ascii_lowercase().as_str() {
            "sha256" | "sha256sum" => Some(Self::Sha256),
            "sha1" | "sha1sum" => Some(Self::Sha1),
            "md5sum" => Some(Self::Md5),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Hasher that can compute hashes using any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha1(Sha1),
    Md5(Md5),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha1(hasher) => hasher.update(data),
            HasherState::Md5(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Sha1(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Md5(hasher) => format!("{:x}", hasher.finalize()),
        }
    }

    /// Get the algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute the hex digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let data = b"hello world";
        assert_eq!(
            hash_bytes(HashAlgorithm::Sha256, data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash_bytes(HashAlgorithm::Sha1, data),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            hash_bytes(HashAlgorithm::Md5, data),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_hasher_incremental() {
        let full = hash_bytes(HashAlgorithm::Sha1, b"Hello, World!");

        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(b"Hello, ");
        hasher.update(b"World!");

        assert_eq!(hasher.algorithm(), HashAlgorithm::Sha1);
        assert_eq!(hasher.finalize(), full);
    }

    #[test]
    fn test_field_names() {
        assert_eq!(HashAlgorithm::from_field("SHA256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_field("SHA256Sum"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_field("SHA1"), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_field("MD5Sum"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_field("MD5sum"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_field("Description"), None);
    }

    #[test]
    fn test_preference_order() {
        let mut sorted = vec![HashAlgorithm::Md5, HashAlgorithm::Sha256, HashAlgorithm::Sha1];
        sorted.sort();
        assert_eq!(sorted, HashAlgorithm::PREFERENCE.to_vec());
    }

}
