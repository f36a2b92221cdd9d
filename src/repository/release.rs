// src/repository/release.rs

//! Release file parsing
//!
//! A Release file is a single stanza of `Key: value` lines. The checksum
//! fields (`SHA256`, `SHA1`, `MD5Sum`) hold one `checksum size path` line
//! per indexed file. Each path is split into a logical name and a
//! compression suffix, so `main/binary-amd64/Packages.xz` is recorded as
//! variant `.xz` of `main/binary-amd64/Packages`.

use super::url_to_filename;
use crate::compression::CompressionFormat;
use crate::download::verify::{DigestVerifier, SizeVerifier, Verifier};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use url::Url;

/// Suffixes split off indexed file names; only some of them can be decoded
const SUFFIXES: [&str; 6] = [".gz", ".bz2", ".xz", ".lzma", ".lz4", ".zst"];

/// Size and checksums of one compression variant of an indexed file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileVariant {
    pub size: u64,
    pub checksums: BTreeMap<HashAlgorithm, String>,
}

impl FileVariant {
    /// Strongest checksum listed for this variant
    pub fn strongest_checksum(&self) -> Option<(HashAlgorithm, &str)> {
        HashAlgorithm::PREFERENCE
            .into_iter()
            .find_map(|algorithm| self.checksums.get(&algorithm).map(|c| (algorithm, c.as_str())))
    }
}

/// The variant of an indexed file chosen for download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    /// Logical name, without compression suffix
    pub name: String,
    pub url: Url,
    pub compression: CompressionFormat,
    pub size: u64,
    /// Size of the uncompressed variant, when listed
    pub uncompressed_size: Option<u64>,
    pub checksum: Option<(HashAlgorithm, String)>,
}

impl IndexFile {
    /// Verifiers for the download: strongest checksum plus exact size
    pub fn verifiers(&self) -> Vec<Box<dyn Verifier>> {
        let mut verifiers: Vec<Box<dyn Verifier>> = Vec::new();
        if let Some((algorithm, checksum)) = &self.checksum {
            verifiers.push(Box::new(DigestVerifier::new(*algorithm, checksum.clone())));
        }
        verifiers.push(Box::new(SizeVerifier::new(self.size)));
        verifiers
    }

    /// Where the file is kept below the lists directory
    pub fn local_path(&self, lists_dir: &Path) -> PathBuf {
        lists_dir.join(url_to_filename(&self.url))
    }
}

/// Parsed Release file
#[derive(Debug, Clone)]
pub struct ReleaseMetadata {
    base_url: Url,
    fields: BTreeMap<String, String>,
    files: BTreeMap<String, BTreeMap<String, FileVariant>>,
}

impl ReleaseMetadata {
    /// Parse a Release file whose indexed paths are relative to `base_url`
    pub fn parse<R: BufRead>(reader: R, base_url: Url) -> Result<Self> {
        let mut release = Self {
            base_url,
            fields: BTreeMap::new(),
            files: BTreeMap::new(),
        };

        let mut key: Option<String> = None;
        for line in reader.lines() {
            let line = line?;
            if line.starts_with([' ', '\t']) {
                if let Some(key) = key.clone() {
                    release.add_info(&key, line.trim())?;
                }
            } else if let Some((name, value)) = line.split_once(':') {
                let name = name.trim_end();
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    release.add_info(name, value.trim())?;
                    key = Some(name.to_string());
                }
            }
        }

        Ok(release)
    }

    /// Parse a Release file from disk
    pub fn from_file(path: &Path, base_url: Url) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        Self::parse(BufReader::new(file), base_url)
    }

    fn add_info(&mut self, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }

        if let Some(algorithm) = HashAlgorithm::from_field(key) {
            let parts: Vec<&str> = value.split_whitespace().collect();
            let parsed = match parts.as_slice() {
                [checksum, size, path] if checksum.chars().all(|c| c.is_ascii_hexdigit()) => {
                    size.parse::<u64>().ok().map(|size| (*checksum, size, *path))
                }
                _ => None,
            };
            let Some((checksum, size, path)) = parsed else {
                return Err(Error::ParseError(format!(
                    "Release file: cannot parse {} file info line {:?}",
                    key, value
                )));
            };
            return self.add_file(algorithm, checksum, size, path);
        }

        self.fields
            .entry(key.to_string())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    fn add_file(
        &mut self,
        algorithm: HashAlgorithm,
        checksum: &str,
        size: u64,
        path: &str,
    ) -> Result<()> {
        let suffix = SUFFIXES
            .iter()
            .copied()
            .find(|suffix| path.ends_with(suffix))
            .unwrap_or("");
        let name = &path[..path.len() - suffix.len()];

        let variants = self.files.entry(name.to_string()).or_default();
        let is_new = !variants.contains_key(suffix);
        let variant = variants.entry(suffix.to_string()).or_default();

        if !is_new && variant.size != size {
            return Err(Error::InconsistentRelease(format!(
                "inconsistent file sizes for {:?}",
                path
            )));
        }
        if variant.checksums.contains_key(&algorithm) {
            return Err(Error::InconsistentRelease(format!(
                "already have {} for {:?}",
                algorithm, path
            )));
        }
        variant.size = size;
        variant
            .checksums
            .insert(algorithm, checksum.to_ascii_lowercase());
        Ok(())
    }

    /// Header field such as `Suite` or `Codename`
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Whether the Release file lists `name` in any variant
    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Listed variants of a logical file, keyed by suffix
    pub fn variants(&self, name: &str) -> Option<&BTreeMap<String, FileVariant>> {
        self.files.get(name)
    }

    /// Choose the smallest decodable variant of `name`
    pub fn index_file(&self, name: &str) -> Result<IndexFile> {
        let variants = self
            .files
            .get(name)
            .ok_or_else(|| Error::NotFoundError(format!("Release didn't contain file {}", name)))?;

        let (suffix, compression, variant) = variants
            .iter()
            .filter_map(|(suffix, variant)| {
                CompressionFormat::from_suffix(suffix).map(|format| (suffix, format, variant))
            })
            .min_by_key(|(_, _, variant)| variant.size)
            .ok_or_else(|| {
                Error::NotFoundError(format!("Release lists no readable variant of {}", name))
            })?;

        let url = self
            .base_url
            .join(&format!("{}{}", name, suffix))
            .map_err(|e| Error::ParseError(format!("Invalid index file path {}: {}", name, e)))?;

        Ok(IndexFile {
            name: name.to_string(),
            url,
            compression,
            size: variant.size,
            uncompressed_size: variants.get("").map(|v| v.size),
            checksum: variant
                .strongest_checksum()
                .map(|(algorithm, checksum)| (algorithm, checksum.to_string())),
        })
    }
}
