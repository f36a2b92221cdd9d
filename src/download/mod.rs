// src/download/mod.rs

//! Verified, cache-aware downloads running on a shared worker queue
//!
//! Each [`DownloadJob`] goes through the same pipeline on a worker of the
//! [`DownloadManager`] queue:
//!
//! 1. **Cache check**: an existing destination is accepted if every
//!    verifier vouches for it, either from file metadata or after one
//!    streaming pass over its content
//! 2. **Fetch**: unless the cached file may be used as-is, GET the URL,
//!    conditional on the cached file's modification time
//! 3. **Stream**: write the body to a temporary file next to the
//!    destination while feeding every chunk to the verifiers, then check
//!    the declared length and let each verifier finish
//! 4. **Publish**: rename the temporary file over the destination, keeping
//!    the previous owner and permission bits where allowed
//!
//! A failure at any step leaves an existing destination untouched.

pub mod fetch;
pub mod verify;

use crate::error::{Error, Result};
use crate::jobs::{Aggregator, Completion, Queue, Scheduler};
use crate::progress::{as_size, ProgressReporter, ProgressTracker};
use fetch::{Fetched, HttpFetcher};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};
use verify::{FastCheck, Verifier};

/// Buffer size for streaming (16 KB)
const CHUNK_SIZE: usize = 16 * 1024;

/// Default width of the download queue
pub const DEFAULT_PARALLEL: usize = 10;

/// How a finished download was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The destination already passed verification; no request was made
    Cached,
    /// The server answered a conditional request with 304
    NotModified,
    /// The content was transferred; `size` bytes
    Fetched { size: u64 },
}

/// A verified file produced by a download job
///
/// For jobs without a destination the file is a temporary file that is
/// removed once the last clone of this value is dropped.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    path: PathBuf,
    outcome: DownloadOutcome,
    temp: Option<Arc<TempPath>>,
}

impl DownloadedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn outcome(&self) -> DownloadOutcome {
        self.outcome
    }

    /// Whether the file is a temporary copy that will be removed
    pub fn is_ephemeral(&self) -> bool {
        self.temp.is_some()
    }

    /// Open the file for reading
    pub fn open(&self) -> Result<File> {
        File::open(&self.path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", self.path.display(), e)))
    }
}

/// Called with the result of a job once the pipeline finishes
pub type DownloadCallback = Box<dyn FnOnce(Result<DownloadedFile>) + Send>;

/// One file to download
pub struct DownloadJob {
    url: String,
    destination: Option<PathBuf>,
    verifiers: Vec<Box<dyn Verifier>>,
    allow_cache: bool,
    check_mtime: bool,
    callback: Option<DownloadCallback>,
    extra: Option<Completion<DownloadedFile>>,
}

impl DownloadJob {
    /// Download `url` into a temporary file, with caching and conditional
    /// requests enabled (they only take effect once a destination is set)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            verifiers: Vec::new(),
            allow_cache: true,
            check_mtime: true,
            callback: None,
            extra: None,
        }
    }

    /// Publish the verified file at `path`
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }

    pub fn verifiers(mut self, verifiers: Vec<Box<dyn Verifier>>) -> Self {
        self.verifiers.extend(verifiers);
        self
    }

    /// Whether an existing destination that passes verification may be used
    pub fn allow_cache(mut self, allow: bool) -> Self {
        self.allow_cache = allow;
        self
    }

    /// Whether a valid cached file is still checked against the server
    /// with a conditional request; without it a cache hit needs no request
    pub fn check_mtime(mut self, check: bool) -> Self {
        self.check_mtime = check;
        self
    }

    /// Callback receiving the job's result
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<DownloadedFile>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn finish(mut self, result: Result<DownloadedFile>) {
        let extra = self.extra.take();
        if let Some(callback) = self.callback.take() {
            callback(result.clone());
        }
        if let Some(completion) = extra {
            completion.complete(result);
        }
    }
}

impl fmt::Display for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)?;
        if let Some(name) = self.destination.as_deref().and_then(Path::file_name) {
            write!(f, " => {}", name.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Settings for the shared download queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub parallel: usize,
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            timeout: fetch::DEFAULT_TIMEOUT,
            max_redirects: fetch::DEFAULT_MAX_REDIRECTS,
        }
    }
}

/// Handle to the download queue; cheap to clone
#[derive(Clone)]
pub struct DownloadManager {
    queue: Queue<DownloadJob>,
    scheduler: Scheduler,
}

impl DownloadManager {
    /// Start the download queue on `scheduler`
    pub fn start(
        scheduler: &Scheduler,
        options: &DownloadOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let pipeline = Pipeline {
            fetcher: HttpFetcher::new(options.timeout, options.max_redirects)?,
            progress,
        };
        let queue = scheduler.start_queue(options.parallel, move |job: DownloadJob| {
            pipeline.run(job)
        })?;

        Ok(Self {
            queue,
            scheduler: scheduler.clone(),
        })
    }

    /// Queue a job; its result goes to the job's callback
    pub fn add(&self, job: DownloadJob) -> Result<()> {
        self.queue.add(job)
    }

    /// Run all jobs and wait for them; results are in job order
    ///
    /// Fails with the first error once every job has finished.
    pub fn wait_all(&self, jobs: Vec<DownloadJob>) -> Result<Vec<DownloadedFile>> {
        self.submit(jobs).results_throw()
    }

    /// Run all jobs and wait for them, keeping per-job results
    ///
    /// Slot `i` holds the file of job `i`, or `None` if it failed; the first
    /// error seen is returned alongside.
    pub fn collect_all(
        &self,
        jobs: Vec<DownloadJob>,
    ) -> (Vec<Option<DownloadedFile>>, Option<Error>) {
        self.submit(jobs).get()
    }

    fn submit(&self, jobs: Vec<DownloadJob>) -> Aggregator<DownloadedFile> {
        let aggregator = Aggregator::new(&self.scheduler);
        for mut job in jobs {
            job.extra = Some(aggregator.collect());
            // A rejected job is dropped with its completion, which fails
            // the slot
            if let Err(e) = self.add(job) {
                warn!("Could not queue download: {}", e);
            }
        }
        aggregator
    }

    /// Run a single job and wait for it
    pub fn wait_one(&self, job: DownloadJob) -> Result<DownloadedFile> {
        self.wait_all(vec![job])?
            .pop()
            .ok_or_else(|| Error::JobFailed("download produced no result".to_string()))
    }

    /// Block until the queue is idle
    pub fn wait(&self) {
        self.queue.wait();
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager")
            .field("queue", &self.queue)
            .finish()
    }
}

struct Pipeline {
    fetcher: HttpFetcher,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    fn run(&self, mut job: DownloadJob) {
        let tracker = self.progress.start(&format!("GET {}", job.url));
        let result = self.process(&mut job, tracker.as_ref());

        match &result {
            Ok(file) => {
                let message = match file.outcome {
                    DownloadOutcome::Cached => "cache".to_string(),
                    DownloadOutcome::NotModified => "Not modified".to_string(),
                    DownloadOutcome::Fetched { size } => as_size(size),
                };
                tracker.finish_with_message(&format!("{} ({})", job, message));
            }
            Err(e) => {
                debug!("Download of {} failed: {}", job, e);
                tracker.finish_with_error(&format!("{}: {}", job, e));
            }
        }
        job.finish(result);
    }

    fn process(
        &self,
        job: &mut DownloadJob,
        tracker: &dyn ProgressTracker,
    ) -> Result<DownloadedFile> {
        let cached_mtime = match &job.destination {
            Some(dest) if job.allow_cache => check_cache(dest, &mut job.verifiers),
            _ => None,
        };

        if let (Some(dest), Some(_)) = (&job.destination, cached_mtime) {
            if !job.check_mtime {
                return Ok(DownloadedFile {
                    path: dest.clone(),
                    outcome: DownloadOutcome::Cached,
                    temp: None,
                });
            }
        }

        let mut content = match self.fetcher.fetch(&job.url, cached_mtime)? {
            Fetched::NotModified => {
                let path = job.destination.clone().ok_or_else(|| {
                    Error::DownloadError("Not modified without a cached file".to_string())
                })?;
                return Ok(DownloadedFile {
                    path,
                    outcome: DownloadOutcome::NotModified,
                    temp: None,
                });
            }
            Fetched::Content(content) => content,
        };

        let dir = match job.destination.as_deref().and_then(Path::parent) {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => std::env::temp_dir(),
        };
        let mut temp = tempfile::Builder::new()
            .prefix(".debsync-")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| {
                Error::IoError(format!("Failed to create temporary file in {}: {}", dir.display(), e))
            })?;

        let content_length = content.content_length();
        let size = stream_verified(&mut content, temp.as_file_mut(), &mut job.verifiers, |have| {
            if let Some(total) = content_length.filter(|&total| total > 0) {
                tracker.set_fraction(have as f64 / total as f64);
            }
        })?;
        check_body_length(content_length, size)?;
        for verifier in job.verifiers.iter_mut() {
            verifier.finish()?;
        }

        let outcome = DownloadOutcome::Fetched { size };
        match &job.destination {
            Some(dest) => {
                publish(temp, dest)?;
                Ok(DownloadedFile {
                    path: dest.clone(),
                    outcome,
                    temp: None,
                })
            }
            None => {
                let temp_path = temp.into_temp_path();
                Ok(DownloadedFile {
                    path: temp_path.to_path_buf(),
                    outcome,
                    temp: Some(Arc::new(temp_path)),
                })
            }
        }
    }
}

/// Feed `reader` through the verifiers into `out`; returns the byte count
fn stream_verified<R, W, F>(
    reader: &mut R,
    out: &mut W,
    verifiers: &mut [Box<dyn Verifier>],
    mut on_progress: F,
) -> Result<u64>
where
    R: Read,
    W: Write,
    F: FnMut(u64),
{
    for verifier in verifiers.iter_mut() {
        verifier.reset();
    }

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut have: u64 = 0;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::DownloadError(format!("Failed to read response: {e}"))),
        };
        let chunk = &buffer[..n];
        for verifier in verifiers.iter_mut() {
            verifier.update(chunk)?;
        }
        out.write_all(chunk)
            .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
        have += n as u64;
        on_progress(have);
    }
    out.flush()?;
    Ok(have)
}

/// A declared `Content-Length` must match the bytes received exactly
fn check_body_length(declared: Option<u64>, actual: u64) -> Result<()> {
    match declared {
        Some(expected) if expected != actual => Err(Error::BodyLengthMismatch { expected, actual }),
        _ => Ok(()),
    }
}

/// Check whether an existing file satisfies all verifiers
///
/// Returns the file's modification time if it does.
fn check_cache(path: &Path, verifiers: &mut [Box<dyn Verifier>]) -> Option<SystemTime> {
    let mut file = File::open(path).ok()?;
    let metadata = file.metadata().ok()?;

    let mut pending = Vec::new();
    for (i, verifier) in verifiers.iter().enumerate() {
        match verifier.fast_verify_file(&metadata) {
            FastCheck::Valid => {}
            FastCheck::Invalid(reason) => {
                debug!("Cache entry {} not valid: {}", path.display(), reason);
                return None;
            }
            FastCheck::Unknown => pending.push(i),
        }
    }

    if !pending.is_empty() {
        for &i in &pending {
            verifiers[i].reset();
        }
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Cache entry {} unreadable: {}", path.display(), e);
                    return None;
                }
            };
            for &i in &pending {
                if let Err(e) = verifiers[i].update(&buffer[..n]) {
                    debug!("Cache entry {} not valid: {}", path.display(), e);
                    return None;
                }
            }
        }
        for &i in &pending {
            if let Err(e) = verifiers[i].finish() {
                debug!("Cache entry {} not valid: {}", path.display(), e);
                return None;
            }
        }
    }

    Some(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH))
}

static PROBE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Metadata of a freshly created file in `dir`, for default ownership and
/// permission bits
fn default_permissions(dir: &Path) -> Result<fs::Metadata> {
    let probe = dir.join(format!(
        ".permissions_check.{}.{}",
        std::process::id(),
        PROBE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)?;
    let metadata = fs::metadata(&probe);
    let _ = fs::remove_file(&probe);
    Ok(metadata?)
}

/// Atomically replace `dest` with `temp`
fn publish(temp: NamedTempFile, dest: &Path) -> Result<()> {
    publish_with(temp, dest, apply_ownership)
}

/// Rename `temp` over `dest`, then hand the previous metadata to `ownership`
///
/// Once renamed the file is published; ownership failures are only logged.
fn publish_with<F>(temp: NamedTempFile, dest: &Path, ownership: F) -> Result<()>
where
    F: FnOnce(&Path, &fs::Metadata) -> io::Result<()>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let reference = match fs::metadata(dest) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => default_permissions(dir)?,
        Err(e) => return Err(e.into()),
    };

    temp.persist(dest)
        .map_err(|e| Error::IoError(format!("Failed to publish {}: {}", dest.display(), e.error)))?;

    match ownership(dest, &reference) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Cannot restore owner and mode of {}: {}", dest.display(), e);
        }
        Err(e) => warn!("Failed to restore owner and mode of {}: {}", dest.display(), e),
    }
    Ok(())
}

/// Copy owner and permission bits of `reference` onto `dest`
///
/// A denied `chown` does not stop the mode from being applied.
#[cfg(unix)]
fn apply_ownership(dest: &Path, reference: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let owner = std::os::unix::fs::chown(dest, Some(reference.uid()), Some(reference.gid()));
    let mode = fs::set_permissions(dest, reference.permissions());
    match owner {
        Err(e) if e.kind() != io::ErrorKind::PermissionDenied => Err(e),
        _ => mode,
    }
}

#[cfg(not(unix))]
fn apply_ownership(dest: &Path, reference: &fs::Metadata) -> io::Result<()> {
    fs::set_permissions(dest, reference.permissions())
}

#[cfg(test)]
mod tests {
    use super::verify::{DigestVerifier, SizeVerifier};
    use super::*;
    use crate::hash::{hash_bytes, HashAlgorithm};
    use tempfile::TempDir;

    fn verifiers_for(data: &[u8]) -> Vec<Box<dyn Verifier>> {
        vec![
            Box::new(DigestVerifier::new(
                HashAlgorithm::Sha256,
                hash_bytes(HashAlgorithm::Sha256, data),
            )),
            Box::new(SizeVerifier::new(data.len() as u64)),
        ]
    }

    #[test]
    fn test_check_cache_streams_unknown_verifiers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Packages");
        fs::write(&path, b"cached content").unwrap();

        assert!(check_cache(&path, &mut verifiers_for(b"cached content")).is_some());
        assert!(check_cache(&path, &mut verifiers_for(b"cached contenT")).is_none());
        assert!(check_cache(&temp.path().join("missing"), &mut verifiers_for(b"")).is_none());
    }

    #[test]
    fn test_check_cache_fast_path_skips_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pkg.deb");
        fs::write(&path, b"12345").unwrap();

        let mut trusted: Vec<Box<dyn Verifier>> = vec![
            Box::new(DigestVerifier::new(HashAlgorithm::Sha256, "bogus").trust_local(true)),
            Box::new(SizeVerifier::new(5)),
        ];
        assert!(check_cache(&path, &mut trusted).is_some());

        let mut wrong_size: Vec<Box<dyn Verifier>> = vec![
            Box::new(DigestVerifier::new(HashAlgorithm::Sha256, "bogus").trust_local(true)),
            Box::new(SizeVerifier::new(4)),
        ];
        assert!(check_cache(&path, &mut wrong_size).is_none());
    }

    #[test]
    fn test_stream_verified_rejects_bad_chunk() {
        let mut out = Vec::new();
        let mut verifiers: Vec<Box<dyn Verifier>> = vec![Box::new(SizeVerifier::new(3))];
        let result = stream_verified(&mut &b"too long"[..], &mut out, &mut verifiers, |_| {});
        assert!(matches!(result, Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_body_length_must_match_declared() {
        assert!(check_body_length(None, 5).is_ok());
        assert!(check_body_length(Some(5), 5).is_ok());
        assert_eq!(
            check_body_length(Some(20), 5),
            Err(Error::BodyLengthMismatch {
                expected: 20,
                actual: 5
            })
        );
    }

    #[test]
    fn test_publish_replaces_destination() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file");
        fs::write(&dest, b"old").unwrap();

        let mut part = NamedTempFile::new_in(temp.path()).unwrap();
        part.write_all(b"new").unwrap();
        publish(part, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new");
        let leftovers: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_publish_keeps_previous_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file");
        fs::write(&dest, b"old").unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o640)).unwrap();

        let part = NamedTempFile::new_in(temp.path()).unwrap();
        publish(part, &dest).unwrap();

        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_publish_survives_ownership_failure() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file");
        fs::write(&dest, b"old").unwrap();

        let mut part = NamedTempFile::new_in(temp.path()).unwrap();
        part.write_all(b"new").unwrap();
        publish_with(part, &dest, |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "read-only file system"))
        })
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new");
        let leftovers: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_job_display() {
        let job = DownloadJob::new("http://example.org/dists/sid/Release")
            .destination("/tmp/lists/example.org_dists_sid_Release");
        assert_eq!(
            job.to_string(),
            "http://example.org/dists/sid/Release => example.org_dists_sid_Release"
        );
    }
}
