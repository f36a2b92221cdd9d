// src/sync.rs

//! The mirror run
//!
//! A [`Mirror`] ties the pieces together for one configuration:
//!
//! 1. load every source concurrently into one [`ArchiveIndex`]
//! 2. write the coverage-compressed essential set to `<lists>/essential_set`
//! 3. select essentials, base packages and extra packages per architecture,
//!    merge the selections and download the resulting `.deb` files
//! 4. write the sorted file list to `<lists>/files` and report `.deb` files
//!    in the package directory that are no longer part of it
//!
//! Stale files are only reported, never removed. The caller drives
//! [`Scheduler::join`] once the run is over.

use crate::config::Config;
use crate::download::DownloadManager;
use crate::error::{Error, Result};
use crate::jobs::{Aggregator, Scheduler};
use crate::progress::{as_size, ProgressReporter};
use crate::repository::{
    essential_set, merge, ArchiveIndex, ArchiveLoader, ArchiveSource, DownloadSummary,
    GpgvVerifier, PackageSelection, SignatureVerifier,
};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Name of the essential set list in the lists directory
pub const ESSENTIAL_SET_FILE: &str = "essential_set";

/// Name of the package file list in the lists directory
pub const FILES_FILE: &str = "files";

/// Outcome of a mirror run
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Coverage-compressed essential set, as written
    pub essential_set: Vec<String>,
    /// Package download results; `files` is the list written
    pub download: DownloadSummary,
    /// `.deb` files in the package directory not in the current selection
    pub stale: Vec<String>,
}

impl SyncReport {
    /// Whether every selected package is present
    pub fn is_complete(&self) -> bool {
        self.download.failed.is_empty()
    }
}

/// A configured mirror
pub struct Mirror {
    config: Config,
    scheduler: Scheduler,
    downloads: DownloadManager,
    loader: ArchiveLoader,
    index: Arc<ArchiveIndex>,
    lists_dir: PathBuf,
    package_dir: PathBuf,
}

impl Mirror {
    /// Set up a mirror verifying signatures with the configured `gpgv`
    pub fn new(
        config: Config,
        scheduler: &Scheduler,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let gpgv = Arc::new(GpgvVerifier::new(config.gpgv_program()));
        Self::with_verifier(config, scheduler, progress, gpgv)
    }

    /// Set up a mirror with a custom signature verifier
    ///
    /// Creates the lists and package directories and starts the download
    /// queue.
    pub fn with_verifier(
        config: Config,
        scheduler: &Scheduler,
        progress: Arc<dyn ProgressReporter>,
        signatures: Arc<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let lists_dir = config.lists_dir();
        let package_dir = config.package_dir();
        for dir in [&lists_dir, &package_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::InitError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let downloads =
            DownloadManager::start(scheduler, &config.download_options(), Arc::clone(&progress))?;
        let loader = ArchiveLoader::new(downloads.clone(), scheduler, &lists_dir, signatures)
            .keyrings(config.keyrings())
            .progress(Arc::clone(&progress));
        let index = Arc::new(ArchiveIndex::new(&config.all_architectures(), progress));

        Ok(Self {
            config,
            scheduler: scheduler.clone(),
            downloads,
            loader,
            index,
            lists_dir,
            package_dir,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn lists_dir(&self) -> &Path {
        &self.lists_dir
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    /// Load all configured sources, one detached job per source
    pub fn load_sources(&self) -> Result<()> {
        let sources = self
            .config
            .sources
            .iter()
            .map(String::as_str)
            .map(ArchiveSource::parse)
            .collect::<Result<Vec<_>>>()?;
        if sources.is_empty() {
            warn!("No sources configured");
        }

        let aggregator = Aggregator::new(&self.scheduler);
        let loader = self.loader.clone();
        let index = Arc::clone(&self.index);
        aggregator.run_each(sources, move |source: ArchiveSource| loader.load(&source, &index));

        if let Err(e) = aggregator.wait_throw() {
            error!("Couldn't load packages lists: {}", e);
            return Err(Error::LoadError(Box::new(e)));
        }
        info!("Indexed {} packages", self.index.len());
        Ok(())
    }

    /// Write the coverage-compressed essential set to the lists directory
    pub fn create_essential_set(&self) -> Result<Vec<String>> {
        let mut selections = Vec::with_capacity(self.config.architectures.len());
        for arch in &self.config.architectures {
            let mut selection = PackageSelection::new(&self.index, arch.clone());
            selection.select_essentials()?;
            selections.push(selection);
        }

        let set = essential_set(&selections, &self.config.architectures);
        write_lines(&self.lists_dir.join(ESSENTIAL_SET_FILE), &set)?;
        info!("Essential set has {} entries", set.len());
        Ok(set)
    }

    /// Resolve essentials plus `names` for every architecture
    pub fn select(&self, names: &[String]) -> Result<Vec<PackageSelection<'_>>> {
        self.config
            .architectures
            .iter()
            .map(|arch| -> Result<PackageSelection<'_>> {
                let mut selection = PackageSelection::new(&self.index, arch.clone());
                selection.select_essentials()?;
                selection.select(names.iter().cloned())?;
                Ok(selection)
            })
            .collect()
    }

    /// `.deb` file names of the closure of `names` for one architecture
    pub fn resolve(&self, architecture: &str, names: &[String]) -> Result<Vec<String>> {
        let mut selection = PackageSelection::new(&self.index, architecture);
        selection.select(names.iter().cloned())?;
        Ok(self.index.files(&selection.entries()))
    }

    /// Select and download essentials, base and extra packages
    pub fn download_minimal_set(&self) -> Result<(DownloadSummary, Vec<String>)> {
        let selections = self.select(&self.config.requested_packages())?;
        let entries = merge(&selections);
        info!(
            "Selected {} packages ({})",
            entries.len(),
            as_size(self.index.size(&entries))
        );

        let summary = self.index.download(&entries, &self.downloads, &self.package_dir);
        write_lines(&self.lists_dir.join(FILES_FILE), &summary.files)?;

        let stale = stale_packages(&self.package_dir, &summary.files)?;
        for name in &stale {
            warn!("Move away {}", name);
        }

        info!(
            "{} files, {} ({} fetched, {} cached, {} failed)",
            summary.files.len(),
            as_size(summary.total_size),
            summary.fetched,
            summary.cached,
            summary.failed.len()
        );
        Ok((summary, stale))
    }

    /// Full run: load sources, write the essential set, download packages
    pub fn run(&self) -> Result<SyncReport> {
        self.load_sources()?;
        let essential_set = self.create_essential_set()?;
        let (download, stale) = self.download_minimal_set()?;
        Ok(SyncReport {
            essential_set,
            download,
            stale,
        })
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("lists_dir", &self.lists_dir)
            .field("package_dir", &self.package_dir)
            .field("index", &self.index)
            .finish()
    }
}

/// Atomically write one line per entry
fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    for line in lines {
        writeln!(temp, "{}", line)?;
    }
    temp.persist(path)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// `.deb` files in `dir` that are not in `keep`, sorted
fn stale_packages(dir: &Path, keep: &[String]) -> Result<Vec<String>> {
    let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();
    let mut stale = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(".deb") && !keep.contains(name.as_str()) {
            stale.push(name);
        }
    }
    stale.sort();
    Ok(stale)
}
