// src/progress.rs

//! Shared progress tracking trait and implementations
//!
//! Every download and every index parse opens one tracker, updates it with
//! a completion fraction and closes it as done or failed. Output modes:
//! - `CliProgress`: one indicatif bar per running item
//! - `LogProgress`: percentage milestones and outcomes through tracing
//! - `SilentProgress`: no-op for tests and quiet runs
//!
//! A [`ProgressReporter`] opens trackers; it is shared between worker
//! threads, so everything here is `Send + Sync`.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Core trait for progress tracking of a single item
pub trait ProgressTracker: Send + Sync {
    /// Set the completion fraction, clamped to `0.0..=1.0`
    fn set_fraction(&self, fraction: f64);

    /// Current completion in percent
    fn percent(&self) -> u64;

    /// Finish progress successfully with a message
    fn finish_with_message(&self, message: &str);

    /// Finish progress with an error message
    fn finish_with_error(&self, message: &str);

    /// Check if progress is finished
    fn is_finished(&self) -> bool;
}

/// Opens a tracker per item of work
pub trait ProgressReporter: Send + Sync {
    fn start(&self, title: &str) -> Box<dyn ProgressTracker>;
}

fn to_percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0) as u64
}

/// Silent progress tracker (no-op)
#[derive(Debug, Default)]
pub struct SilentProgress {
    percent: AtomicU64,
    finished: AtomicBool,
}

impl SilentProgress {
    /// Create a new silent progress tracker
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for SilentProgress {
    fn set_fraction(&self, fraction: f64) {
        self.percent.store(to_percent(fraction), Ordering::Relaxed);
    }

    fn percent(&self) -> u64 {
        self.percent.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Logging progress tracker
///
/// Logs each crossed 25% milestone at debug level and the outcome at info
/// (or warn, for failures).
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    percent: AtomicU64,
    finished: AtomicBool,
}

impl LogProgress {
    /// Create a new logging progress tracker
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            percent: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

impl ProgressTracker for LogProgress {
    fn set_fraction(&self, fraction: f64) {
        let new = to_percent(fraction);
        let old = self.percent.swap(new, Ordering::Relaxed);
        if new / 25 > old / 25 {
            tracing::debug!("{}: {}%", self.name, new);
        }
    }

    fn percent(&self) -> u64 {
        self.percent.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("[DONE] {}", message);
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        warn!("[FAIL] {}", message);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Terminal progress bar for one item
pub struct CliProgress {
    bar: ProgressBar,
}

impl ProgressTracker for CliProgress {
    fn set_fraction(&self, fraction: f64) {
        self.bar.set_position(to_percent(fraction));
    }

    fn percent(&self) -> u64 {
        self.bar.position()
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(format!("[DONE] {}", message));
    }

    fn finish_with_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("[FAIL] {}", message));
    }

    fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

/// Reporter that logs through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn start(&self, title: &str) -> Box<dyn ProgressTracker> {
        Box::new(LogProgress::new(title))
    }
}

/// Reporter that discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn start(&self, _title: &str) -> Box<dyn ProgressTracker> {
        Box::new(SilentProgress::new())
    }
}

/// Reporter drawing one bar per running item under a shared MultiProgress
pub struct CliReporter {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl CliReporter {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("[{bar:20.yellow/dim}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::new(),
            style,
        }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for CliReporter {
    fn start(&self, title: &str) -> Box<dyn ProgressTracker> {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(self.style.clone());
        bar.set_message(title.to_string());
        Box::new(CliProgress { bar })
    }
}

/// Format a byte count for humans (`B`, `KiB`, `MiB`, `GiB`, `TiB`)
///
/// Divides while the value is above 512, so sizes read as e.g. `0.6 MiB`
/// rather than `600 KiB`. One decimal is shown only for values below 10
/// with a fraction of at least 0.1.
pub fn as_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes <= 512 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value > 512.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 10.0 || value.fract() < 0.1 {
        format!("{} {}", value as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_progress() {
        let progress = SilentReporter.start("test");

        progress.set_fraction(0.5);
        assert_eq!(progress.percent(), 50);

        progress.set_fraction(1.7);
        assert_eq!(progress.percent(), 100);

        assert!(!progress.is_finished());
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_log_progress() {
        let progress = LogProgress::new("Packages");

        progress.set_fraction(0.25);
        progress.set_fraction(0.3);
        assert_eq!(progress.percent(), 30);

        progress.finish_with_error("checksum mismatch");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_as_size() {
        assert_eq!(as_size(0), "0 B");
        assert_eq!(as_size(512), "512 B");
        assert_eq!(as_size(513), "0.5 KiB");
        assert_eq!(as_size(1024), "1 KiB");
        assert_eq!(as_size(1536), "1.5 KiB");
        assert_eq!(as_size(102_400), "100 KiB");
        assert_eq!(as_size(10 * 1024 + 700), "10 KiB");
        assert_eq!(as_size(600 * 1024), "0.6 MiB");
        assert_eq!(as_size(3 * 1024 * 1024 * 1024), "3 GiB");
    }
}
