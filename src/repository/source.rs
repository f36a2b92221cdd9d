// src/repository/source.rs

//! Archive source descriptors and the loader that indexes them
//!
//! A source is a `deb <uri> <suite> [<component>...]` line. Two layouts
//! are supported:
//!
//! - **Standard**: `<uri>/dists/<suite>/Release` lists
//!   `<component>/binary-<arch>/Packages` for every component and
//!   architecture; `Filename` fields are relative to `<uri>`.
//! - **Direct**: the suite is a path ending in `/` (with an optional
//!   `$(ARCH)` placeholder) holding its own `Release` and `Packages`;
//!   `Filename` fields are relative to that directory.
//!
//! Every `Release` file is fetched together with its detached
//! `Release.gpg` and must pass signature verification before it is used.

use super::{
    url_to_filename, ArchiveIndex, PackagesParser, ReleaseMetadata, SignatureVerifier, ARCH_ALL,
};
use crate::download::{DownloadJob, DownloadManager};
use crate::error::{Error, Result};
use crate::jobs::{Aggregator, Scheduler};
use crate::progress::{ProgressReporter, SilentReporter};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Placeholder replaced by each architecture in direct layouts
const ARCH_PLACEHOLDER: &str = "$(ARCH)";

/// How the metadata of a source is laid out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// `dists/<suite>/<component>/binary-<arch>/Packages`
    Standard {
        suite: String,
        components: Vec<String>,
    },
    /// `Release` and `Packages` directly under `path`
    Direct { path: String },
}

/// A parsed `deb` source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    /// Archive base URI, always ending in `/`
    pub uri: Url,
    pub layout: Layout,
}

impl ArchiveSource {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let kind = words.next().unwrap_or_default();
        if kind != "deb" {
            return Err(Error::ConfigError(format!(
                "Cannot handle {:?} lines, expected 'deb'",
                kind
            )));
        }
        let (Some(uri), Some(suite)) = (words.next(), words.next()) else {
            return Err(Error::ConfigError(format!(
                "Source line needs an URI and a suite: {:?}",
                line
            )));
        };
        let components: Vec<String> = words.map(str::to_string).collect();

        let layout = if suite.ends_with('/') {
            if !components.is_empty() {
                return Err(Error::ConfigError(
                    "Distribution is exact path (ends in /), mustn't list components".to_string(),
                ));
            }
            Layout::Direct {
                path: suite.to_string(),
            }
        } else {
            if components.is_empty() {
                return Err(Error::ConfigError(
                    "No components and suite is not an exact path (doesn't end in /)".to_string(),
                ));
            }
            Layout::Standard {
                suite: suite.to_string(),
                components,
            }
        };

        let uri = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{}/", uri)
        };
        let uri = Url::parse(&uri)
            .map_err(|e| Error::ConfigError(format!("Invalid archive URI {:?}: {}", uri, e)))?;

        Ok(Self { uri, layout })
    }

    /// Directories holding a `Release` file, one per distinct expansion of
    /// the architecture placeholder
    fn release_dirs(&self, architectures: &[String]) -> Result<Vec<Url>> {
        let mut dirs: Vec<Url> = Vec::new();
        match &self.layout {
            Layout::Standard { suite, .. } => dirs.push(join(&self.uri, &format!("dists/{}/", suite))?),
            Layout::Direct { path } => {
                for arch in architectures {
                    let dir = join(&self.uri, &path.replace(ARCH_PLACEHOLDER, arch))?;
                    if !dirs.contains(&dir) {
                        dirs.push(dir);
                    }
                }
            }
        }
        Ok(dirs)
    }
}

impl FromStr for ArchiveSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.layout {
            Layout::Standard { suite, components } => {
                write!(f, "deb {} {} {}", self.uri, suite, components.join(" "))
            }
            Layout::Direct { path } => write!(f, "deb {} {}", self.uri, path),
        }
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::ConfigError(format!("Invalid path {:?} below {}: {}", path, base, e)))
}

/// Downloads, verifies and indexes the metadata of archive sources
#[derive(Clone)]
pub struct ArchiveLoader {
    downloads: DownloadManager,
    scheduler: Scheduler,
    lists_dir: PathBuf,
    keyrings: Vec<PathBuf>,
    signatures: Arc<dyn SignatureVerifier>,
    progress: Arc<dyn ProgressReporter>,
}

impl ArchiveLoader {
    /// Loader keeping metadata in `lists_dir`; signatures are checked with
    /// `signatures` against no keyrings until [`ArchiveLoader::keyrings`]
    /// is set
    pub fn new(
        downloads: DownloadManager,
        scheduler: &Scheduler,
        lists_dir: impl Into<PathBuf>,
        signatures: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            downloads,
            scheduler: scheduler.clone(),
            lists_dir: lists_dir.into(),
            keyrings: Vec::new(),
            signatures,
            progress: Arc::new(SilentReporter),
        }
    }

    pub fn keyrings(mut self, keyrings: Vec<PathBuf>) -> Self {
        self.keyrings = keyrings;
        self
    }

    /// Reporter for index parsing progress
    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch `Release` and `Release.gpg` from `dir` in parallel, verify the
    /// signature and parse the release
    pub fn signed_download(&self, dir: &Url) -> Result<ReleaseMetadata> {
        let release_url = join(dir, "Release")?;
        let signature_url = join(dir, "Release.gpg")?;
        let release_path = self.lists_dir.join(url_to_filename(&release_url));
        let signature_path = self.lists_dir.join(url_to_filename(&signature_url));

        self.downloads.wait_all(vec![
            DownloadJob::new(release_url.as_str()).destination(&release_path),
            DownloadJob::new(signature_url.as_str()).destination(&signature_path),
        ])?;

        self.signatures
            .verify(&release_path, &signature_path, &self.keyrings)
            .map_err(|e| match e {
                Error::GpgVerificationFailed(reason) => {
                    Error::GpgVerificationFailed(format!("{}: {}", release_url, reason))
                }
                other => other,
            })?;
        debug!("Signature of {} verified", release_url);

        ReleaseMetadata::from_file(&release_path, dir.clone())
    }

    /// Download one index listed in `release` and add its records
    ///
    /// Returns the number of records read.
    pub fn load_packages(
        &self,
        release: &ReleaseMetadata,
        name: &str,
        base_url: &Url,
        index: &ArchiveIndex,
    ) -> Result<usize> {
        let file = release.index_file(name)?;
        let path = file.local_path(&self.lists_dir);
        self.downloads.wait_one(
            DownloadJob::new(file.url.as_str())
                .destination(&path)
                .verifiers(file.verifiers()),
        )?;

        let parser =
            PackagesParser::open(&path, file.compression, base_url.clone(), file.uncompressed_size)?;
        let tracker = self.progress.start(&format!("Indexing {}", file.url));
        match index.ingest(parser, tracker.as_ref()) {
            Ok(count) => {
                tracker.finish_with_message(&format!("{} ({} packages)", file.url, count));
                Ok(count)
            }
            Err(e) => {
                tracker.finish_with_error(&format!("{}: {}", file.url, e));
                Err(e)
            }
        }
    }

    /// Load every index of `source` into `index`, concurrently
    pub fn load(&self, source: &ArchiveSource, index: &Arc<ArchiveIndex>) -> Result<()> {
        info!("Loading {}", source);
        let dirs = source.release_dirs(index.architectures())?;

        match &source.layout {
            Layout::Standard { components, .. } => {
                let dir = dirs
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::ConfigError(format!("No release for {}", source)))?;
                let release = Arc::new(self.signed_download(&dir)?);

                let names: Vec<String> = index
                    .architectures()
                    .iter()
                    .flat_map(|arch| {
                        components
                            .iter()
                            .map(move |component| format!("{}/binary-{}/Packages", component, arch))
                    })
                    .collect();

                let aggregator = Aggregator::new(&self.scheduler);
                let loader = self.clone();
                let index = Arc::clone(index);
                let base_url = source.uri.clone();
                aggregator.run_each(names, move |name: String| {
                    // Archives without architecture-independent indices only
                    // list binary-<arch>
                    if name.contains(&format!("/binary-{}/", ARCH_ALL)) && !release.has_file(&name) {
                        debug!("{} not listed in {}, skipping", name, release.base_url());
                        return Ok(0);
                    }
                    loader.load_packages(&release, &name, &base_url, &index)
                });
                aggregator.wait_throw()
            }
            Layout::Direct { .. } => {
                let aggregator = Aggregator::new(&self.scheduler);
                let loader = self.clone();
                let index = Arc::clone(index);
                aggregator.run_each(dirs, move |dir: Url| {
                    let release = loader.signed_download(&dir)?;
                    loader.load_packages(&release, "Packages", &dir, &index)
                });
                aggregator.wait_throw()
            }
        }
    }
}

impl fmt::Debug for ArchiveLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveLoader")
            .field("lists_dir", &self.lists_dir)
            .field("keyrings", &self.keyrings)
            .finish()
    }
}
