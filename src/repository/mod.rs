// src/repository/mod.rs

//! Debian archive metadata, indexing and package selection
//!
//! This module provides functionality for:
//! - Parsing Release files and choosing which index variant to fetch
//! - Streaming Packages stanzas into [`PackageRecord`]s
//! - Loading archive sources (standard `dists/` and direct layouts)
//! - Verifying Release signatures with `gpgv`
//! - Indexing records per architecture with virtual-package lookup
//! - Resolving dependency closures into selections

pub mod gpg;
pub mod index;
pub mod packages;
pub mod release;
pub mod selection;
pub mod source;

pub use gpg::{GpgvVerifier, SignatureVerifier};
pub use index::{ArchiveIndex, DownloadSummary};
pub use packages::{PackageRecord, PackagesParser};
pub use release::{IndexFile, ReleaseMetadata};
pub use selection::{essential_set, merge, PackageSelection, SelectionEntry};
pub use source::{ArchiveLoader, ArchiveSource, Layout};

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

/// Pseudo-architecture of architecture-independent packages
pub const ARCH_ALL: &str = "all";

static VERSION_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("version clause pattern is valid"));

static SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("/+").expect("slash pattern is valid"));

/// `architectures` in order, deduplicated, with [`ARCH_ALL`] appended if
/// missing
pub fn with_arch_all(architectures: &[String]) -> Vec<String> {
    let mut all: Vec<String> = Vec::with_capacity(architectures.len() + 1);
    for arch in architectures.iter().map(String::as_str).chain([ARCH_ALL]) {
        if !all.iter().any(|known| known == arch) {
            all.push(arch.to_string());
        }
    }
    all
}

/// Split a relationship field (`Depends`, `Provides`, ...) into its
/// comma-separated clauses, with version constraints removed
///
/// `"libc6 (>= 2.36), perl | perl-base"` gives `["libc6", "perl | perl-base"]`.
/// Whitespace runs collapse to one space; empty clauses are dropped.
pub(crate) fn relationship_clauses(field: &str) -> Vec<String> {
    VERSION_CLAUSE
        .replace_all(field, "")
        .split(',')
        .map(|clause| clause.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|clause| !clause.is_empty())
        .collect()
}

/// Local file name for a downloaded URL: host and path, with every run of
/// slashes replaced by `_`
///
/// `http://deb.debian.org/debian/dists/sid/Release` becomes
/// `deb.debian.org_debian_dists_sid_Release`.
pub fn url_to_filename(url: &Url) -> String {
    let raw = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    SLASHES.replace_all(&raw, "_").into_owned()
}
