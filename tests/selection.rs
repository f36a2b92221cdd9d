// tests/selection.rs

//! Dependency-closure selection: cycles, alternatives, virtual packages,
//! merging and the coverage-compressed essential set.

mod common;

use common::{index_from, FakePackage};
use debsync::repository::{essential_set, merge, PackageSelection, SelectionEntry};
use debsync::Error;
use std::collections::BTreeSet;

fn entries(selection: &PackageSelection<'_>) -> BTreeSet<(String, String)> {
    selection
        .entries()
        .into_iter()
        .map(|entry| (entry.name, entry.architecture))
        .collect()
}

fn pair(name: &str, arch: &str) -> (String, String) {
    (name.to_string(), arch.to_string())
}

#[test]
fn test_dependency_cycle_terminates() {
    let index = index_from(
        &["amd64"],
        &[
            FakePackage::new("a", "1", "amd64").depends("b"),
            FakePackage::new("b", "1", "amd64").depends("a (>= 1)"),
        ],
    );

    let mut selection = PackageSelection::new(&index, "amd64");
    selection.select(["a"]).unwrap();

    assert_eq!(entries(&selection), BTreeSet::from([pair("a", "amd64"), pair("b", "amd64")]));
    assert_eq!(selection.selection()["a"].len(), 1);
    assert_eq!(selection.selection()["b"].len(), 1);
}

#[test]
fn test_closure_follows_pre_depends_and_all() {
    let index = index_from(
        &["amd64", "i386"],
        &[
            FakePackage::new("app", "2.0", "amd64")
                .pre_depends("libc6 (>= 2.36)")
                .depends("app-data, perl:any | perl-base"),
            FakePackage::new("app-data", "2.0", "all"),
            FakePackage::new("libc6", "2.36-9", "amd64"),
            FakePackage::new("perl", "5.36", "amd64"),
            FakePackage::new("perl-base", "5.36", "amd64"),
        ],
    );

    let mut selection = PackageSelection::new(&index, "amd64");
    selection.select(["app"]).unwrap();

    assert_eq!(
        entries(&selection),
        BTreeSet::from([
            pair("app", "amd64"),
            pair("app-data", "all"),
            pair("libc6", "amd64"),
            pair("perl", "amd64"),
        ])
    );
    assert!(!selection.contains("perl-base"));
}

#[test]
fn test_first_resolvable_alternative_wins() {
    let index = index_from(
        &["amd64"],
        &[
            FakePackage::new("tool", "1", "amd64").depends("missing | second | third"),
            FakePackage::new("second", "1", "amd64"),
            FakePackage::new("third", "1", "amd64"),
        ],
    );

    let mut selection = PackageSelection::new(&index, "amd64");
    selection.select(["tool"]).unwrap();
    assert!(selection.contains("second"));
    assert!(!selection.contains("third"));
}

#[test]
fn test_virtual_package_resolves_to_provider() {
    let index = index_from(
        &["amd64"],
        &[
            FakePackage::new("editor-user", "1", "amd64").depends("editor"),
            FakePackage::new("nano", "7.2", "amd64").provides("editor"),
            FakePackage::new("vim", "9.0", "amd64").provides("editor, vi (= 9.0)"),
        ],
    );

    let found = index.find("editor", "amd64").unwrap().unwrap();
    assert_eq!(found.name, "nano");
    assert_eq!(index.find("vi", "amd64").unwrap().unwrap().name, "vim");

    let mut selection = PackageSelection::new(&index, "amd64");
    selection.select(["editor-user"]).unwrap();
    assert_eq!(
        entries(&selection),
        BTreeSet::from([pair("editor-user", "amd64"), pair("nano", "amd64")])
    );
}

#[test]
fn test_selection_is_deterministic() {
    let packages = [
        FakePackage::new("foo", "1", "amd64").depends("bar | baz, mta"),
        FakePackage::new("bar", "1", "all").depends("foo"),
        FakePackage::new("baz", "1", "amd64"),
        FakePackage::new("exim", "4", "amd64").provides("mta"),
        FakePackage::new("postfix", "3", "amd64").provides("mta"),
    ];
    let index = index_from(&["amd64"], &packages);

    let mut first = PackageSelection::new(&index, "amd64");
    first.select(["foo"]).unwrap();
    let mut second = PackageSelection::new(&index, "amd64");
    second.select(["foo"]).unwrap();

    assert_eq!(entries(&first), entries(&second));
    assert!(first.contains("exim"));
}

#[test]
fn test_missing_package_fails() {
    let index = index_from(&["amd64"], &[FakePackage::new("foo", "1", "amd64")]);

    let mut selection = PackageSelection::new(&index, "amd64");
    let err = selection.select(["nope"]).unwrap_err();
    assert_eq!(err, Error::NotFoundError("Package \"nope\" not found".to_string()));
}

#[test]
fn test_unfulfillable_dependency_names_clause() {
    let index = index_from(
        &["amd64"],
        &[FakePackage::new("foo", "1", "amd64").depends("libc6, gone (>= 2) | absent")],
    );
    // libc6 is missing too, and is the first clause
    let mut selection = PackageSelection::new(&index, "amd64");
    assert_eq!(
        selection.select(["foo"]).unwrap_err(),
        Error::UnfulfillableDependency("libc6".to_string())
    );

    let index = index_from(
        &["amd64"],
        &[
            FakePackage::new("foo", "1", "amd64").depends("libc6, gone (>= 2) | absent"),
            FakePackage::new("libc6", "1", "amd64"),
        ],
    );
    let mut selection = PackageSelection::new(&index, "amd64");
    assert_eq!(
        selection.select(["foo"]).unwrap_err(),
        Error::UnfulfillableDependency("gone | absent".to_string())
    );
}

#[test]
fn test_select_essentials_uses_target_and_all() {
    let index = index_from(
        &["amd64", "i386"],
        &[
            FakePackage::new("base-files", "12", "amd64").essential(),
            FakePackage::new("dash", "0.5", "amd64").essential(),
            FakePackage::new("dash", "0.5", "i386").essential(),
            FakePackage::new("tzdata", "2024a", "all").essential(),
            FakePackage::new("hello", "2.10", "amd64"),
        ],
    );

    let mut selection = PackageSelection::new(&index, "i386");
    selection.select_essentials().unwrap();
    assert_eq!(
        entries(&selection),
        BTreeSet::from([pair("dash", "i386"), pair("tzdata", "all")])
    );
}

#[test]
fn test_merge_and_essential_set_coverage() {
    let architectures = vec!["amd64".to_string(), "i386".to_string()];
    let index = index_from(
        &["amd64", "i386"],
        &[
            FakePackage::new("base-files", "12", "amd64").essential(),
            FakePackage::new("dash", "0.5", "amd64").essential(),
            FakePackage::new("dash", "0.5", "i386").essential(),
            FakePackage::new("tzdata", "2024a", "all").essential(),
        ],
    );

    let selections: Vec<PackageSelection<'_>> = architectures
        .iter()
        .map(|arch| {
            let mut selection = PackageSelection::new(&index, arch.clone());
            selection.select_essentials().unwrap();
            selection
        })
        .collect();

    assert_eq!(
        essential_set(&selections, &architectures),
        vec!["base-files:amd64", "dash", "tzdata"]
    );
    assert_eq!(
        merge(&selections),
        vec![
            SelectionEntry::new("base-files", "amd64"),
            SelectionEntry::new("dash", "amd64"),
            SelectionEntry::new("dash", "i386"),
            SelectionEntry::new("tzdata", "all"),
        ]
    );
    assert_eq!(
        index.files(&merge(&selections)),
        vec![
            "base-files_12_amd64.deb",
            "dash_0.5_amd64.deb",
            "dash_0.5_i386.deb",
            "tzdata_2024a_all.deb",
        ]
    );
}
