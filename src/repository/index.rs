// src/repository/index.rs

//! In-memory index of the package records of all loaded archives
//!
//! Records are keyed by package name and architecture. When two sources
//! list the same (name, architecture), the higher version wins and a tie
//! keeps the record indexed first.
//!
//! The provides table (virtual name to providing packages) is built once,
//! on the first lookup or an explicit [`ArchiveIndex::index_provides`].
//! From then on the index is frozen and further ingestion fails with
//! [`Error::IndexFrozen`]. Everything sits behind one mutex, so several
//! sources can be ingested from concurrent jobs.

use super::{relationship_clauses, with_arch_all, PackageRecord, SelectionEntry, ARCH_ALL};
use crate::download::{DownloadJob, DownloadManager, DownloadOutcome};
use crate::error::{Error, Result};
use crate::progress::{ProgressReporter, ProgressTracker};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Virtual name -> provider architecture -> providing package names
type ProvidesTable = HashMap<String, BTreeMap<String, Vec<String>>>;

struct Entry {
    record: Arc<PackageRecord>,
    /// Order in which the (name, architecture) slot was first filled
    seq: u64,
}

#[derive(Default)]
struct IndexState {
    packages: HashMap<String, BTreeMap<String, Entry>>,
    provides: Option<ProvidesTable>,
    next_seq: u64,
}

impl IndexState {
    fn insert(&mut self, record: PackageRecord) {
        let slots = self.packages.entry(record.name.clone()).or_default();
        match slots.get_mut(&record.architecture) {
            Some(existing) => {
                if existing.record.version < record.version {
                    debug!(
                        "{} ({}): {} replaces {}",
                        record.name,
                        record.architecture,
                        record.version,
                        existing.record.version
                    );
                    existing.record = Arc::new(record);
                }
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                slots.insert(
                    record.architecture.clone(),
                    Entry {
                        record: Arc::new(record),
                        seq,
                    },
                );
            }
        }
    }

    fn build_provides(&self, tracker: &dyn ProgressTracker) -> ProvidesTable {
        let mut entries: Vec<&Entry> = self
            .packages
            .values()
            .flat_map(|slots| slots.values())
            .collect();
        entries.sort_by_key(|entry| entry.seq);

        let total = entries.len().max(1) as f64;
        let mut table = ProvidesTable::new();
        for (pos, entry) in entries.into_iter().enumerate() {
            tracker.set_fraction(pos as f64 / total);
            let Some(provides) = entry.record.provides.as_deref() else {
                continue;
            };
            for name in relationship_clauses(provides) {
                let providers = table
                    .entry(name)
                    .or_default()
                    .entry(entry.record.architecture.clone())
                    .or_default();
                if !providers.contains(&entry.record.name) {
                    providers.push(entry.record.name.clone());
                }
            }
        }
        table
    }

    fn real(&self, name: &str, arch: &str) -> Option<Arc<PackageRecord>> {
        let slots = self.packages.get(name)?;
        slots
            .get(arch)
            .or_else(|| slots.get(ARCH_ALL))
            .map(|entry| Arc::clone(&entry.record))
    }

    fn find(
        &self,
        provides: &ProvidesTable,
        name: &str,
        arch: &str,
        path: &mut Vec<String>,
    ) -> Result<Option<Arc<PackageRecord>>> {
        if let Some(record) = self.real(name, arch) {
            return Ok(Some(record));
        }
        let Some(by_arch) = provides.get(name) else {
            return Ok(None);
        };

        if path.iter().any(|seen| seen == name) {
            return Err(Error::ProvidesCycle(name.to_string()));
        }
        path.push(name.to_string());

        let candidates = by_arch
            .get(arch)
            .into_iter()
            .chain(by_arch.get(ARCH_ALL).filter(|_| arch != ARCH_ALL))
            .flatten();
        for provider in candidates {
            if let Some(record) = self.find(provides, provider, arch, path)? {
                path.pop();
                return Ok(Some(record));
            }
        }

        path.pop();
        Ok(None)
    }
}

/// Files planned and fetched by a package download
#[derive(Debug, Default)]
pub struct DownloadSummary {
    /// Every `.deb` file name of the request, sorted
    pub files: Vec<String>,
    /// Files transferred from the archive
    pub fetched: usize,
    /// Files already present and valid
    pub cached: usize,
    /// Files that could not be downloaded, with the reason
    pub failed: Vec<(String, Error)>,
    /// Size of all requested files in bytes
    pub total_size: u64,
}

/// Package records of all loaded archives
pub struct ArchiveIndex {
    state: Mutex<IndexState>,
    architectures: Vec<String>,
    progress: Arc<dyn ProgressReporter>,
}

impl ArchiveIndex {
    /// Create an empty index for the given target architectures
    ///
    /// `all` is added to the architecture list if missing.
    pub fn new(architectures: &[String], progress: Arc<dyn ProgressReporter>) -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            architectures: with_arch_all(architectures),
            progress,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Architectures the index serves, including `all`
    pub fn architectures(&self) -> &[String] {
        &self.architectures
    }

    /// Add parsed records, reporting progress to `tracker`
    ///
    /// Returns the number of records read. The index stays locked for the
    /// whole run; a parse error stops ingestion but keeps the records added
    /// before it.
    pub fn ingest<I>(&self, records: I, tracker: &dyn ProgressTracker) -> Result<usize>
    where
        I: IntoIterator<Item = Result<(PackageRecord, f64)>>,
    {
        let mut state = self.lock();
        if state.provides.is_some() {
            return Err(Error::IndexFrozen);
        }

        let mut count = 0;
        for item in records {
            let (record, fraction) = item?;
            tracker.set_fraction(fraction);
            state.insert(record);
            count += 1;
        }
        Ok(count)
    }

    /// Build the provides table; later calls do nothing
    pub fn index_provides(&self) {
        let mut state = self.lock();
        Self::ensure_provides(&mut state, self.progress.as_ref());
    }

    fn ensure_provides(state: &mut IndexState, progress: &dyn ProgressReporter) {
        if state.provides.is_none() {
            let tracker = progress.start("Indexing provides");
            let table = state.build_provides(tracker.as_ref());
            tracker.finish_with_message(&format!("Indexed {} virtual packages", table.len()));
            state.provides = Some(table);
        }
    }

    /// Whether the provides table has been built
    pub fn is_frozen(&self) -> bool {
        self.lock().provides.is_some()
    }

    /// Number of (name, architecture) records
    pub fn len(&self) -> usize {
        self.lock().packages.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `name` for `arch` to a concrete record
    ///
    /// Real packages at `arch` or `all` come first; otherwise the first
    /// provider (for `arch`, then `all`) that resolves is used. Fails with
    /// [`Error::ProvidesCycle`] if providers lead back to a name already
    /// being resolved.
    pub fn find(&self, name: &str, arch: &str) -> Result<Option<Arc<PackageRecord>>> {
        let mut state = self.lock();
        Self::ensure_provides(&mut state, self.progress.as_ref());
        let state = &*state;
        match &state.provides {
            Some(provides) => state.find(provides, name, arch, &mut Vec::new()),
            None => Ok(None),
        }
    }

    /// Names of all essential packages for `arch` (or `all`), sorted
    pub fn essential_packages(&self, arch: &str) -> Vec<String> {
        let state = self.lock();
        let names: BTreeSet<&String> = state
            .packages
            .iter()
            .filter(|(_, slots)| {
                slots
                    .iter()
                    .any(|(a, entry)| (a == arch || a == ARCH_ALL) && entry.record.essential)
            })
            .map(|(name, _)| name)
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Records of a real package
    ///
    /// With an architecture, the record for it or else for `all`; without,
    /// the records for every index architecture.
    pub fn find_all(&self, name: &str, arch: Option<&str>) -> Vec<Arc<PackageRecord>> {
        let state = self.lock();
        match arch {
            Some(arch) => state.real(name, arch).into_iter().collect(),
            None => self.records_of(&state, name),
        }
    }

    fn records_of(&self, state: &IndexState, name: &str) -> Vec<Arc<PackageRecord>> {
        let Some(slots) = state.packages.get(name) else {
            return Vec::new();
        };
        self.architectures
            .iter()
            .filter_map(|arch| slots.get(arch))
            .map(|entry| Arc::clone(&entry.record))
            .collect()
    }

    fn selected_records(&self, entries: &[SelectionEntry]) -> Vec<Arc<PackageRecord>> {
        let state = self.lock();
        let mut seen = BTreeSet::new();
        entries
            .iter()
            .filter_map(|entry| state.real(&entry.name, &entry.architecture))
            .filter(|record| seen.insert(record.deb_filename()))
            .collect()
    }

    fn all_records(&self) -> Vec<Arc<PackageRecord>> {
        let state = self.lock();
        let mut records: Vec<_> = state
            .packages
            .keys()
            .flat_map(|name| self.records_of(&state, name))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then(a.architecture.cmp(&b.architecture)));
        records
    }

    /// Sorted `.deb` file names of a selection
    pub fn files(&self, entries: &[SelectionEntry]) -> Vec<String> {
        sorted_files(&self.selected_records(entries))
    }

    /// Sorted `.deb` file names of every indexed package
    pub fn files_all(&self) -> Vec<String> {
        sorted_files(&self.all_records())
    }

    /// Total size in bytes of a selection
    pub fn size(&self, entries: &[SelectionEntry]) -> u64 {
        self.selected_records(entries).iter().map(|r| r.size).sum()
    }

    /// Total size in bytes of every indexed package
    pub fn size_all(&self) -> u64 {
        self.all_records().iter().map(|r| r.size).sum()
    }

    /// Download the packages of a selection into `package_dir`
    pub fn download(
        &self,
        entries: &[SelectionEntry],
        downloads: &DownloadManager,
        package_dir: &Path,
    ) -> DownloadSummary {
        download_records(self.selected_records(entries), downloads, package_dir)
    }

    /// Download every indexed package into `package_dir`
    pub fn download_all(&self, downloads: &DownloadManager, package_dir: &Path) -> DownloadSummary {
        download_records(self.all_records(), downloads, package_dir)
    }
}

impl std::fmt::Debug for ArchiveIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveIndex")
            .field("architectures", &self.architectures)
            .field("records", &self.len())
            .finish()
    }
}

fn sorted_files(records: &[Arc<PackageRecord>]) -> Vec<String> {
    let mut files: Vec<String> = records.iter().map(|r| r.deb_filename()).collect();
    files.sort();
    files.dedup();
    files
}

fn download_records(
    records: Vec<Arc<PackageRecord>>,
    downloads: &DownloadManager,
    package_dir: &Path,
) -> DownloadSummary {
    let mut summary = DownloadSummary {
        total_size: records.iter().map(|r| r.size).sum(),
        ..Default::default()
    };
    let names: Vec<String> = records.iter().map(|r| r.deb_filename()).collect();
    let failures = Arc::new(Mutex::new(Vec::new()));

    let jobs = records
        .iter()
        .zip(&names)
        .map(|(record, name)| {
            let failures = Arc::clone(&failures);
            let failed_name = name.clone();
            DownloadJob::new(record.url.as_str())
                .destination(package_dir.join(name))
                .verifiers(record.verifiers())
                .allow_cache(true)
                .check_mtime(false)
                .on_complete(move |result| {
                    if let Err(e) = result {
                        failures
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((failed_name, e));
                    }
                })
        })
        .collect();

    info!("Downloading {} packages", names.len());
    let (results, _) = downloads.collect_all(jobs);
    for file in results.into_iter().flatten() {
        match file.outcome() {
            DownloadOutcome::Cached | DownloadOutcome::NotModified => summary.cached += 1,
            DownloadOutcome::Fetched { .. } => summary.fetched += 1,
        }
    }

    let mut failed = std::mem::take(&mut *failures.lock().unwrap_or_else(PoisonError::into_inner));
    failed.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, e) in &failed {
        warn!("Failed to download {}: {}", name, e);
    }
    summary.failed = failed;

    summary.files = names;
    summary.files.sort();
    summary
}
