// src/config.rs
//! Mirror configuration
//!
//! The configuration is a YAML document; every key is optional. Relative
//! paths are resolved against the directory holding the configuration
//! file.
//!
//! ```yaml
//! architectures: [amd64, arm64]
//! sources:
//!   - deb http://deb.debian.org/debian bookworm main
//! extra-packages: [git]
//! download:
//!   parallel: 4
//! ```

use crate::download::DownloadOptions;
use crate::error::{Error, Result};
use crate::repository::with_arch_all;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Keyring trusted by apt on the host
const SYSTEM_KEYRING: &str = "/etc/apt/trusted.gpg";

/// Directory of further apt keyrings
const SYSTEM_KEYRING_GLOB: &str = "/etc/apt/trusted.gpg.d/*.gpg";

/// Download queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DownloadConfig {
    /// Number of concurrent downloads
    pub parallel: usize,

    /// Per-request timeout in seconds
    pub timeout: u64,

    /// Redirects followed per request
    pub max_redirects: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let options = DownloadOptions::default();
        Self {
            parallel: options.parallel,
            timeout: options.timeout.as_secs(),
            max_redirects: options.max_redirects,
        }
    }
}

/// Mirror configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Target architectures
    pub architectures: Vec<String>,

    /// Where Release and Packages files and the generated lists go
    pub lists_directory: PathBuf,

    /// Where `.deb` files go
    pub package_directory: PathBuf,

    /// Additional trusted keyrings
    pub keyrings: Vec<PathBuf>,

    /// Also trust the host's apt keyrings
    pub system_keyrings: bool,

    /// `deb <uri> <suite> [<component>...]` lines
    pub sources: Vec<String>,

    pub download: DownloadConfig,

    /// Packages selected on top of the essential set
    pub base_packages: Vec<String>,

    /// Further packages to select
    pub extra_packages: Vec<String>,

    /// Signature verification program
    pub gpgv: PathBuf,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            architectures: vec!["amd64".to_string(), "i386".to_string()],
            lists_directory: PathBuf::from("lists"),
            package_directory: PathBuf::from("packages"),
            keyrings: Vec::new(),
            system_keyrings: true,
            sources: Vec::new(),
            download: DownloadConfig::default(),
            base_packages: [
                // build environment
                "build-essential",
                // chroot tools
                "less",
                "kmod",
                "libdevmapper1.02.1",
                "net-tools",
                "procps",
                "psmisc",
                "strace",
                "user-setup",
                "vim",
                // packaging tools
                "fakeroot",
                "debhelper",
                "lintian",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            extra_packages: Vec::new(),
            gpgv: PathBuf::from("gpgv"),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load the configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path).map_err(|e| {
            Error::ConfigError(format!("Cannot open config {}: {}", path.display(), e))
        })?;
        let content = fs::read_to_string(&path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let config = Self::parse(&content, base_dir)?;
        debug!("Loaded config {}", path.display());
        Ok(config)
    }

    /// Parse a YAML document; relative paths are resolved against `base_dir`
    pub fn parse(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        // An empty document means all defaults
        let mut config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| Error::ConfigError(format!("Invalid configuration: {}", e)))?
        };
        config.base_dir = base_dir.into();

        let mut architectures: Vec<String> = Vec::new();
        for arch in config.architectures.drain(..) {
            if !architectures.contains(&arch) {
                architectures.push(arch);
            }
        }
        config.architectures = architectures;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.architectures.is_empty() {
            return Err(Error::ConfigError("No architectures configured".to_string()));
        }
        if self.download.parallel == 0 {
            return Err(Error::ConfigError(
                "download.parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    /// Target architectures plus `all`
    pub fn all_architectures(&self) -> Vec<String> {
        with_arch_all(&self.architectures)
    }

    pub fn lists_dir(&self) -> PathBuf {
        self.resolve(&self.lists_directory)
    }

    pub fn package_dir(&self) -> PathBuf {
        self.resolve(&self.package_directory)
    }

    /// Configured keyrings, followed by the readable system keyrings when
    /// enabled
    pub fn keyrings(&self) -> Vec<PathBuf> {
        let mut keyrings: Vec<PathBuf> = self.keyrings.iter().map(|k| self.resolve(k)).collect();
        if self.system_keyrings {
            let mut system = vec![PathBuf::from(SYSTEM_KEYRING)];
            if let Ok(paths) = glob::glob(SYSTEM_KEYRING_GLOB) {
                let mut found: Vec<PathBuf> = paths.filter_map(|entry| entry.ok()).collect();
                found.sort();
                system.extend(found);
            }
            keyrings.extend(system.into_iter().filter(|path| fs::File::open(path).is_ok()));
        }
        keyrings
    }

    /// Path of the signature verification program
    ///
    /// A bare program name is left for `PATH` lookup.
    pub fn gpgv_program(&self) -> PathBuf {
        if self.gpgv.components().count() > 1 {
            self.resolve(&self.gpgv)
        } else {
            self.gpgv.clone()
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            parallel: self.download.parallel,
            timeout: Duration::from_secs(self.download.timeout),
            max_redirects: self.download.max_redirects,
        }
    }

    /// Every package to select besides the essential set
    pub fn requested_packages(&self) -> Vec<String> {
        self.base_packages
            .iter()
            .chain(&self.extra_packages)
            .cloned()
            .collect()
    }
}
