// tests/common/mod.rs

//! Shared test utilities: fake packages, archive metadata and a stand-in
//! signature verifier.

#![allow(dead_code)]

use debsync::hash::{hash_bytes, HashAlgorithm};
use debsync::progress::{SilentProgress, SilentReporter};
use debsync::repository::{ArchiveIndex, PackagesParser, SignatureVerifier};
use debsync::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// A package to list in a fake archive
#[derive(Debug, Clone)]
pub struct FakePackage {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub pre_depends: Option<String>,
    pub depends: Option<String>,
    pub provides: Option<String>,
    pub essential: bool,
    pub content: Vec<u8>,
}

impl FakePackage {
    pub fn new(name: &str, version: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
            pre_depends: None,
            depends: None,
            provides: None,
            essential: false,
            content: format!("{name} {version} {arch}").into_bytes(),
        }
    }

    pub fn depends(mut self, depends: &str) -> Self {
        self.depends = Some(depends.to_string());
        self
    }

    pub fn pre_depends(mut self, pre_depends: &str) -> Self {
        self.pre_depends = Some(pre_depends.to_string());
        self
    }

    pub fn provides(mut self, provides: &str) -> Self {
        self.provides = Some(provides.to_string());
        self
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    /// Path of the `.deb` below the archive root
    pub fn pool_path(&self) -> String {
        format!(
            "pool/main/{}_{}_{}.deb",
            self.name, self.version, self.arch
        )
    }

    /// Name the mirror stores the package under
    pub fn deb_filename(&self) -> String {
        format!("{}_{}_{}.deb", self.name, self.version, self.arch)
    }

    fn stanza(&self) -> String {
        let mut stanza = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\n",
            self.name, self.version, self.arch
        );
        if self.essential {
            stanza.push_str("Essential: yes\n");
        }
        if let Some(pre_depends) = &self.pre_depends {
            stanza.push_str(&format!("Pre-Depends: {pre_depends}\n"));
        }
        if let Some(depends) = &self.depends {
            stanza.push_str(&format!("Depends: {depends}\n"));
        }
        if let Some(provides) = &self.provides {
            stanza.push_str(&format!("Provides: {provides}\n"));
        }
        stanza.push_str(&format!(
            "Filename: {}\nSize: {}\nSHA256: {}\nDescription: {} test package\n",
            self.pool_path(),
            self.content.len(),
            hash_bytes(HashAlgorithm::Sha256, &self.content),
            self.name
        ));
        stanza
    }
}

/// Render a Packages index
pub fn packages_text(packages: &[FakePackage]) -> String {
    packages
        .iter()
        .map(FakePackage::stanza)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a Release file listing `files` (path relative to the Release
/// directory, content) with SHA256 and MD5 checksums
pub fn release_text(files: &[(&str, &[u8])]) -> String {
    let mut text = String::from("Origin: Test\nSuite: testing\nCodename: test\n");
    for (field, algorithm) in [("MD5Sum", HashAlgorithm::Md5), ("SHA256", HashAlgorithm::Sha256)] {
        text.push_str(field);
        text.push_str(":\n");
        for (path, content) in files {
            text.push_str(&format!(
                " {} {} {}\n",
                hash_bytes(algorithm, content),
                content.len(),
                path
            ));
        }
    }
    text
}

/// Index `packages` for `architectures`
pub fn index_from(architectures: &[&str], packages: &[FakePackage]) -> ArchiveIndex {
    index_at("http://archive.test/debian/", architectures, packages)
}

/// Index `packages` with their pool paths joined to `base`
pub fn index_at(base: &str, architectures: &[&str], packages: &[FakePackage]) -> ArchiveIndex {
    let architectures: Vec<String> = architectures.iter().map(|a| a.to_string()).collect();
    let index = ArchiveIndex::new(&architectures, Arc::new(SilentReporter));
    let text = packages_text(packages);
    let parser = PackagesParser::new(
        text.as_bytes(),
        Url::parse(base).unwrap(),
        Some(text.len() as u64),
    );
    index.ingest(parser, &SilentProgress::new()).unwrap();
    index
}

/// Signature verifier that accepts signatures whose content is `good`
#[derive(Debug, Default)]
pub struct FakeSignatures {
    calls: AtomicUsize,
}

impl FakeSignatures {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SignatureVerifier for FakeSignatures {
    fn verify(&self, file: &Path, signature: &Path, _keyrings: &[PathBuf]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !file.exists() {
            return Err(Error::GpgVerificationFailed(format!(
                "{} missing",
                file.display()
            )));
        }
        match fs::read(signature) {
            Ok(content) if content == b"good" => Ok(()),
            _ => Err(Error::GpgVerificationFailed("BAD signature".to_string())),
        }
    }
}
