// src/repository/selection.rs

//! Dependency-closure selection over an [`ArchiveIndex`]
//!
//! A [`PackageSelection`] resolves requested names for one target
//! architecture. Resolution is a breadth-first walk over `Pre-Depends` and
//! `Depends`: for each clause the first alternative that resolves (ignoring
//! version constraints) is followed. Names already selected are skipped,
//! which makes dependency cycles terminate.
//!
//! Selections of several architectures are combined with [`merge`] for
//! downloading, and with [`essential_set`] for the coverage-compressed
//! list of essential packages.

use super::{relationship_clauses, ArchiveIndex, PackageRecord, ARCH_ALL};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::debug;

/// A resolved package: concrete name and the architecture of its record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectionEntry {
    pub name: String,
    pub architecture: String,
}

impl SelectionEntry {
    pub fn new(name: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architecture: architecture.into(),
        }
    }
}

impl fmt::Display for SelectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.architecture)
    }
}

/// Packages selected for one target architecture
#[derive(Debug)]
pub struct PackageSelection<'a> {
    index: &'a ArchiveIndex,
    architecture: String,
    selection: BTreeMap<String, Vec<SelectionEntry>>,
}

impl<'a> PackageSelection<'a> {
    /// Start an empty selection; freezes the index
    pub fn new(index: &'a ArchiveIndex, architecture: impl Into<String>) -> Self {
        index.index_provides();
        Self {
            index,
            architecture: architecture.into(),
            selection: BTreeMap::new(),
        }
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Resolved entries, keyed by the name that was requested
    pub fn selection(&self) -> &BTreeMap<String, Vec<SelectionEntry>> {
        &self.selection
    }

    /// All resolved entries, sorted and without duplicates
    pub fn entries(&self) -> Vec<SelectionEntry> {
        merge(std::slice::from_ref(self))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.selection.contains_key(name)
    }

    /// Select every essential package of the target architecture
    pub fn select_essentials(&mut self) -> Result<()> {
        let essentials = self.index.essential_packages(&self.architecture);
        self.select(essentials)
    }

    /// Select `names` with their full dependency closure
    ///
    /// A name that does not resolve fails with [`Error::NotFoundError`], a
    /// dependency clause without any resolvable alternative with
    /// [`Error::UnfulfillableDependency`]. Entries resolved before the
    /// failure stay in the selection.
    pub fn select<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queue: VecDeque<String> = names.into_iter().map(Into::into).collect();

        while let Some(name) = queue.pop_front() {
            if self.selection.contains_key(&name) {
                continue;
            }
            let record = self
                .index
                .find(&name, &self.architecture)?
                .ok_or_else(|| Error::NotFoundError(format!("Package {:?} not found", name)))?;

            self.add_dependencies(&mut queue, record.pre_depends.as_deref())?;
            self.add_dependencies(&mut queue, record.depends.as_deref())?;

            debug!("Selected {} as {}:{}", name, record.name, record.architecture);
            self.selection
                .entry(name)
                .or_default()
                .push(entry_for(&record));
        }
        Ok(())
    }

    fn add_dependencies(&self, queue: &mut VecDeque<String>, field: Option<&str>) -> Result<()> {
        let Some(field) = field else {
            return Ok(());
        };

        for clause in relationship_clauses(field) {
            let mut resolved = None;
            for alternative in clause.split('|').map(strip_qualifier) {
                if alternative.is_empty() {
                    continue;
                }
                if let Some(record) = self.index.find(alternative, &self.architecture)? {
                    resolved = Some(record);
                    break;
                }
            }
            match resolved {
                Some(record) => queue.push_back(record.name.clone()),
                None => return Err(Error::UnfulfillableDependency(clause)),
            }
        }
        Ok(())
    }
}

fn entry_for(record: &PackageRecord) -> SelectionEntry {
    SelectionEntry::new(record.name.clone(), record.architecture.clone())
}

/// Trim an alternative and drop a multiarch qualifier such as `:any`
fn strip_qualifier(alternative: &str) -> &str {
    let alternative = alternative.trim();
    match alternative.split_once(':') {
        Some((name, _)) => name.trim_end(),
        None => alternative,
    }
}

/// Union of the entries of several selections, sorted and deduplicated
pub fn merge(selections: &[PackageSelection<'_>]) -> Vec<SelectionEntry> {
    let entries: BTreeSet<SelectionEntry> = selections
        .iter()
        .flat_map(|selection| selection.selection.values().flatten().cloned())
        .collect();
    entries.into_iter().collect()
}

/// Coverage-compressed list of the packages in `selections`
///
/// A package resolved for every target architecture, or resolved to an
/// `all` record, is listed by its bare name; otherwise it is listed as
/// `name:arch` once per architecture it was resolved for. Output is sorted
/// by name.
pub fn essential_set(selections: &[PackageSelection<'_>], architectures: &[String]) -> Vec<String> {
    let targets: BTreeSet<&str> = architectures.iter().map(String::as_str).collect();
    let mut coverage: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for entry in selections
        .iter()
        .flat_map(|selection| selection.selection.values().flatten())
    {
        coverage
            .entry(entry.name.as_str())
            .or_default()
            .insert(entry.architecture.as_str());
    }

    let mut set = Vec::new();
    for (name, archs) in coverage {
        if archs.contains(ARCH_ALL) || archs == targets {
            set.push(name.to_string());
        } else {
            set.extend(archs.into_iter().map(|arch| format!("{}:{}", name, arch)));
        }
    }
    set
}
