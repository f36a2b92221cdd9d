// src/error.rs

//! Error types for debsync
//!
//! A single error enum covers every failure the library can surface. It is
//! `Clone` because one download result is delivered to more than one
//! consumer (the job callback and an aggregator slot).

use thiserror::Error;

/// Main error type for debsync operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // Resolution
    #[error("{0}")]
    NotFoundError(String),

    #[error("Cannot fulfill dependency {0:?}")]
    UnfulfillableDependency(String),

    #[error("Index already frozen")]
    IndexFrozen,

    #[error("Provides cycle while resolving {0:?}")]
    ProvidesCycle(String),

    // Verification
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: {actual} != {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    // Transport
    #[error("Unexpected response code {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Redirect limit exceeded for {0}")]
    RedirectLimitExceeded(String),

    #[error("Unexpected response body size: {actual} != {expected}")]
    BodyLengthMismatch { expected: u64, actual: u64 },

    #[error("{0} downloads not supported")]
    UnsupportedScheme(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    // Consistency
    #[error("Release file: {0}")]
    InconsistentRelease(String),

    #[error("GPG verification failed: {0}")]
    GpgVerificationFailed(String),

    #[error("Couldn't load packages lists: {0}")]
    LoadError(Box<Error>),

    // Scheduling
    #[error("Queue is closed")]
    QueueClosed,

    #[error("Job failed: {0}")]
    JobFailed(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

/// Result type alias for debsync operations
pub type Result<T> = std::result::Result<T, Error>;
