// src/repository/packages.rs

//! Streaming parser for Debian `Packages` index files
//!
//! Stanzas are read one line at a time from a (possibly compressed) index
//! and yielded as [`PackageRecord`]s together with the fraction of the
//! input consumed so far, so a large index never has to be held in memory.
//! Only the fields needed for indexing and downloading are kept.

use crate::compression::{create_decoder, CompressionFormat};
use crate::download::verify::{DigestVerifier, SizeVerifier, Verifier};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::version::DebianVersion;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use url::Url;

/// Fields kept from a stanza, in their canonical spelling
const FIELDS: [&str; 9] = [
    "Package",
    "Version",
    "Architecture",
    "Filename",
    "Size",
    "Depends",
    "Pre-Depends",
    "Provides",
    "Essential",
];

/// A binary package as listed in a Packages index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub version: DebianVersion,
    pub architecture: String,
    pub pre_depends: Option<String>,
    pub depends: Option<String>,
    pub provides: Option<String>,
    pub essential: bool,
    /// Path of the `.deb` relative to the archive base
    pub filename: String,
    pub size: u64,
    pub checksums: BTreeMap<HashAlgorithm, String>,
    /// Absolute download URL
    pub url: Url,
}

impl PackageRecord {
    /// Local file name: `<Package>_<Version>_<Architecture>.deb`
    pub fn deb_filename(&self) -> String {
        format!(
            "{}_{}_{}.deb",
            self.name,
            self.version.as_str(),
            self.architecture
        )
    }

    /// Strongest checksum listed for the package
    pub fn strongest_checksum(&self) -> Option<(HashAlgorithm, &str)> {
        HashAlgorithm::PREFERENCE
            .into_iter()
            .find_map(|algorithm| self.checksums.get(&algorithm).map(|c| (algorithm, c.as_str())))
    }

    /// Verifiers for downloading the package
    ///
    /// An existing local file with the right size is trusted without
    /// rehashing it.
    pub fn verifiers(&self) -> Vec<Box<dyn Verifier>> {
        let mut verifiers: Vec<Box<dyn Verifier>> = Vec::new();
        if let Some((algorithm, checksum)) = self.strongest_checksum() {
            verifiers.push(Box::new(
                DigestVerifier::new(algorithm, checksum).trust_local(true),
            ));
        }
        verifiers.push(Box::new(SizeVerifier::new(self.size)));
        verifiers
    }
}

/// Fields of the stanza being read
#[derive(Default)]
struct Stanza {
    fields: HashMap<&'static str, String>,
    checksums: BTreeMap<HashAlgorithm, String>,
}

/// Where a continuation line goes
#[derive(Clone, Copy)]
enum Current {
    Field(&'static str),
    Checksum(HashAlgorithm),
    Ignored,
}

impl Stanza {
    fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.checksums.is_empty()
    }

    fn slot(&mut self, current: Current) -> Option<&mut String> {
        match current {
            Current::Field(name) => self.fields.get_mut(name),
            Current::Checksum(algorithm) => self.checksums.get_mut(&algorithm),
            Current::Ignored => None,
        }
    }

    fn set(&mut self, current: Current, value: String) {
        if value.is_empty() {
            return;
        }
        match current {
            Current::Field(name) => {
                self.fields.insert(name, value);
            }
            Current::Checksum(algorithm) => {
                self.checksums.insert(algorithm, value);
            }
            Current::Ignored => {}
        }
    }

    fn continue_value(&mut self, current: Current, value: &str) {
        // A lone "." stands for an empty line
        let value = if value == "." { "" } else { value };
        match self.slot(current) {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None if !value.is_empty() => self.set(current, value.to_string()),
            None => {}
        }
    }

    fn take(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name).filter(|value| !value.is_empty())
    }

    fn into_record(mut self, base_url: &Url) -> Result<PackageRecord> {
        let name = self
            .take("Package")
            .ok_or_else(|| Error::ParseError("Packages stanza without Package field".to_string()))?;
        let mut require = |field: &str| {
            self.take(field).ok_or_else(|| {
                Error::ParseError(format!("Package {:?} has no {} field", name, field))
            })
        };

        let version = DebianVersion::parse(&require("Version")?)?;
        let architecture = require("Architecture")?;
        let filename = require("Filename")?;
        let size_field = require("Size")?;
        let size = size_field.trim().parse::<u64>().map_err(|e| {
            Error::ParseError(format!("Package {:?} has invalid Size {:?}: {}", name, size_field, e))
        })?;
        let url = base_url.join(&filename).map_err(|e| {
            Error::ParseError(format!("Package {:?} has invalid Filename {:?}: {}", name, filename, e))
        })?;

        let essential = self.take("Essential").is_some_and(|v| v == "yes");
        let pre_depends = self.take("Pre-Depends");
        let depends = self.take("Depends");
        let provides = self.take("Provides");
        let checksums = self
            .checksums
            .into_iter()
            .map(|(algorithm, checksum)| (algorithm, checksum.trim().to_ascii_lowercase()))
            .collect();

        Ok(PackageRecord {
            name,
            version,
            architecture,
            pre_depends,
            depends,
            provides,
            essential,
            filename,
            size,
            checksums,
            url,
        })
    }
}

fn classify(key: &str) -> Current {
    if let Some(field) = FIELDS.iter().copied().find(|field| field.eq_ignore_ascii_case(key)) {
        return Current::Field(field);
    }
    match key.to_ascii_lowercase().as_str() {
        "sha256" => Current::Checksum(HashAlgorithm::Sha256),
        "sha1" => Current::Checksum(HashAlgorithm::Sha1),
        "md5sum" => Current::Checksum(HashAlgorithm::Md5),
        _ => Current::Ignored,
    }
}

fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Iterator over the records of a Packages index
///
/// Each item carries the fraction of the input read so far, for progress
/// display. Parsing stops after the first error.
pub struct PackagesParser<R> {
    reader: R,
    base_url: Url,
    total: Option<u64>,
    position: u64,
    line: Vec<u8>,
    done: bool,
}

impl PackagesParser<BufReader<Box<dyn Read>>> {
    /// Open an index file on disk
    ///
    /// `total` is the uncompressed size, when known; for uncompressed files
    /// it defaults to the file size.
    pub fn open(
        path: &Path,
        compression: CompressionFormat,
        base_url: Url,
        total: Option<u64>,
    ) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        let total = match (total, compression) {
            (Some(total), _) => Some(total),
            (None, CompressionFormat::None) => file.metadata().ok().map(|m| m.len()),
            (None, _) => None,
        };
        let decoder = create_decoder(file, compression);
        Ok(Self::new(BufReader::new(decoder), base_url, total))
    }
}

impl<R: BufRead> PackagesParser<R> {
    /// Parse records from `reader`; `Filename` fields are resolved against
    /// `base_url`
    pub fn new(reader: R, base_url: Url, total: Option<u64>) -> Self {
        Self {
            reader,
            base_url,
            total,
            position: 0,
            line: Vec::new(),
            done: false,
        }
    }

    fn fraction(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.position as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }

    fn next_record(&mut self) -> Result<Option<PackageRecord>> {
        let mut stanza = Stanza::default();
        let mut current = Current::Ignored;

        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|e| Error::ParseError(format!("Failed to read Packages index: {}", e)))?;
            if read == 0 {
                break;
            }
            self.position += read as u64;

            let line = String::from_utf8_lossy(&self.line);
            let trimmed = line.trim_end_matches([' ', '\t', '\r', '\n']);

            if trimmed.trim_start_matches([' ', '\t']).is_empty() {
                if !stanza.is_empty() {
                    break;
                }
                current = Current::Ignored;
            } else if trimmed.starts_with([' ', '\t']) {
                stanza.continue_value(current, trimmed.trim_start_matches([' ', '\t']));
            } else if let Some((key, value)) = trimmed.split_once(':') {
                let key = key.trim_end_matches([' ', '\t']);
                current = if is_key(key) {
                    classify(key)
                } else {
                    Current::Ignored
                };
                stanza.set(current, value.trim_start_matches([' ', '\t']).to_string());
            }
        }

        if stanza.is_empty() {
            return Ok(None);
        }
        stanza.into_record(&self.base_url).map(Some)
    }
}

impl<R: BufRead> Iterator for PackagesParser<R> {
    type Item = Result<(PackageRecord, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok((record, self.fraction()))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
