// src/download/verify.rs

//! Streaming verification of downloaded content
//!
//! Verifiers see every chunk of a download before it is written and get a
//! final say once the body is complete. For cache hits they may also vouch
//! for an existing file from its metadata alone, see [`FastCheck`].

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher};
use std::fs::Metadata;

/// Outcome of checking an existing file without reading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastCheck {
    /// The file is known to be good
    Valid,
    /// The file is known to be bad
    Invalid(String),
    /// Content must be streamed through the verifier to decide
    Unknown,
}

/// Incremental check applied to a download
///
/// The pipeline calls `reset` before each pass, `update` once per chunk and
/// `finish` after the last chunk. A verifier is owned by a single job.
pub trait Verifier: Send {
    fn reset(&mut self);

    fn update(&mut self, chunk: &[u8]) -> Result<()>;

    fn finish(&mut self) -> Result<()>;

    /// Judge an existing file from its metadata
    fn fast_verify_file(&self, _metadata: &Metadata) -> FastCheck {
        FastCheck::Unknown
    }
}

/// Checks the digest of the content
///
/// With `trust_local`, an existing file is accepted without hashing it;
/// other verifiers on the same job (typically [`SizeVerifier`]) still apply.
pub struct DigestVerifier {
    algorithm: HashAlgorithm,
    expected: String,
    trust_local: bool,
    hasher: Option<Hasher>,
}

impl DigestVerifier {
    pub fn new(algorithm: HashAlgorithm, expected: impl Into<String>) -> Self {
        Self {
            algorithm,
            expected: expected.into().to_ascii_lowercase(),
            trust_local: false,
            hasher: None,
        }
    }

    /// Accept existing local files without re-hashing them
    pub fn trust_local(mut self, trust: bool) -> Self {
        self.trust_local = trust;
        self
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl Verifier for DigestVerifier {
    fn reset(&mut self) {
        self.hasher = Some(Hasher::new(self.algorithm));
    }

    fn update(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher
            .get_or_insert_with(|| Hasher::new(self.algorithm))
            .update(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let hasher = self
            .hasher
            .take()
            .unwrap_or_else(|| Hasher::new(self.algorithm));
        let actual = hasher.finalize();
        if actual == self.expected {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                expected: self.expected.clone(),
                actual,
            })
        }
    }

    fn fast_verify_file(&self, _metadata: &Metadata) -> FastCheck {
        if self.trust_local {
            FastCheck::Valid
        } else {
            FastCheck::Unknown
        }
    }
}

/// Checks the exact byte count of the content
pub struct SizeVerifier {
    expected: u64,
    have: u64,
}

impl SizeVerifier {
    pub fn new(expected: u64) -> Self {
        Self { expected, have: 0 }
    }
}

impl Verifier for SizeVerifier {
    fn reset(&mut self) {
        self.have = 0;
    }

    fn update(&mut self, chunk: &[u8]) -> Result<()> {
        self.have += chunk.len() as u64;
        // No point in reading on once the file is too long
        if self.have > self.expected {
            return Err(Error::SizeMismatch {
                expected: self.expected,
                actual: self.have,
            });
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.have == self.expected {
            Ok(())
        } else {
            Err(Error::SizeMismatch {
                expected: self.expected,
                actual: self.have,
            })
        }
    }

    fn fast_verify_file(&self, metadata: &Metadata) -> FastCheck {
        if metadata.len() == self.expected {
            FastCheck::Valid
        } else {
            FastCheck::Invalid(format!(
                "size mismatch: {} != {}",
                metadata.len(),
                self.expected
            ))
        }
    }
}
