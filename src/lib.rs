// src/lib.rs

//! debsync
//!
//! Mirrors a minimal, dependency-closed subset of Debian-style binary
//! package archives: fetches signed index metadata, indexes package records
//! per architecture, resolves package names to their transitive dependency
//! closure and downloads the resulting `.deb` files with verification and
//! local caching.
//!
//! # Architecture
//!
//! - Jobs: bounded worker queues, detached jobs and ordered result
//!   aggregation on one shared [`jobs::Scheduler`]
//! - Downloads: cache check, conditional GET, streamed verification and
//!   atomic publish as queue jobs ([`download::DownloadManager`])
//! - Repository: Release/Packages parsing, signed source loading, the
//!   [`repository::ArchiveIndex`] and dependency-closure selection
//! - Sync: the mirror run tying it together ([`sync::Mirror`])

pub mod compression;
pub mod config;
pub mod download;
mod error;
pub mod hash;
pub mod jobs;
pub mod progress;
pub mod repository;
pub mod sync;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::HashAlgorithm;
pub use jobs::{Aggregator, Completion, Queue, Scheduler};
pub use repository::{ArchiveIndex, ArchiveSource, PackageRecord, PackageSelection};
pub use sync::{Mirror, SyncReport};
pub use version::DebianVersion;
