// tests/sync.rs

//! End-to-end mirror runs against a fake archive served over HTTP

mod common;

use common::{packages_text, release_text, FakePackage, FakeSignatures};
use debsync::progress::SilentReporter;
use debsync::sync::{ESSENTIAL_SET_FILE, FILES_FILE};
use debsync::{Config, Error, Mirror, Result, Scheduler, SyncReport};
use mockito::{Mock, Server, ServerGuard};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// A signed `test` suite with one `main/binary-amd64` index
struct FakeArchive {
    server: ServerGuard,
    packages: Vec<FakePackage>,
    debs: Vec<Mock>,
    _metadata: Vec<Mock>,
}

impl FakeArchive {
    fn new(packages: Vec<FakePackage>, signature: &str) -> Self {
        let mut server = Server::new();
        let index = packages_text(&packages);
        let release = release_text(&[("main/binary-amd64/Packages", index.as_bytes())]);

        let metadata = vec![
            server
                .mock("GET", "/debian/dists/test/Release")
                .with_body(release)
                .create(),
            server
                .mock("GET", "/debian/dists/test/Release.gpg")
                .with_body(signature)
                .create(),
            server
                .mock("GET", "/debian/dists/test/main/binary-amd64/Packages")
                .with_body(index)
                .create(),
        ];

        Self {
            server,
            packages,
            debs: Vec::new(),
            _metadata: metadata,
        }
    }

    /// Serve every package; each may be fetched at most `hits` times
    fn serve_packages(&mut self, hits: usize) {
        for package in &self.packages {
            let mock = self
                .server
                .mock("GET", format!("/debian/{}", package.pool_path()).as_str())
                .with_body(&package.content)
                .expect_at_most(hits)
                .create();
            self.debs.push(mock);
        }
    }

    fn config(&self, dir: &TempDir, extra: &[&str]) -> Config {
        let yaml = format!(
            "\
architectures: [amd64]
lists-directory: lists
package-directory: packages
system-keyrings: false
sources:
  - deb {}/debian test main
base-packages: []
extra-packages: [{}]
",
            self.server.url(),
            extra.join(", ")
        );
        Config::parse(&yaml, dir.path()).unwrap()
    }
}

fn run(config: Config, signatures: &Arc<FakeSignatures>) -> Result<SyncReport> {
    let scheduler = Scheduler::new();
    let result = Mirror::with_verifier(
        config,
        &scheduler,
        Arc::new(SilentReporter),
        signatures.clone(),
    )
    .and_then(|mirror| mirror.run());
    scheduler.join();
    result
}

fn archive_packages() -> Vec<FakePackage> {
    vec![
        FakePackage::new("base-files", "12.4", "amd64").essential(),
        FakePackage::new("hello", "2.10-3", "amd64").depends("libc6 (>= 2.34)"),
        FakePackage::new("libc6", "2.36-9", "amd64"),
        FakePackage::new("unrelated", "1.0", "amd64"),
    ]
}

#[test]
fn test_sync_mirrors_closure() {
    let mut archive = FakeArchive::new(archive_packages(), "good");
    archive.serve_packages(1);
    let temp = TempDir::new().unwrap();
    let signatures = Arc::new(FakeSignatures::default());

    let report = run(archive.config(&temp, &["hello"]), &signatures).unwrap();

    assert!(report.is_complete());
    assert_eq!(report.essential_set, vec!["base-files"]);
    assert_eq!(
        report.download.files,
        vec![
            "base-files_12.4_amd64.deb",
            "hello_2.10-3_amd64.deb",
            "libc6_2.36-9_amd64.deb",
        ]
    );
    assert_eq!(report.download.fetched, 3);
    assert_eq!(report.download.cached, 0);
    assert!(report.stale.is_empty());
    assert!(signatures.calls() >= 1);

    let lists = temp.path().join("lists");
    assert_eq!(
        fs::read_to_string(lists.join(ESSENTIAL_SET_FILE)).unwrap(),
        "base-files\n"
    );
    assert_eq!(
        fs::read_to_string(lists.join(FILES_FILE)).unwrap(),
        "base-files_12.4_amd64.deb\nhello_2.10-3_amd64.deb\nlibc6_2.36-9_amd64.deb\n"
    );

    let packages = temp.path().join("packages");
    let hello = &archive.packages[1];
    assert_eq!(fs::read(packages.join(hello.deb_filename())).unwrap(), hello.content);
    assert!(!packages.join(archive.packages[3].deb_filename()).exists());
}

#[test]
fn test_second_sync_uses_cached_packages() {
    let mut archive = FakeArchive::new(archive_packages(), "good");
    archive.serve_packages(1);
    let temp = TempDir::new().unwrap();
    let signatures = Arc::new(FakeSignatures::default());

    let first = run(archive.config(&temp, &["hello"]), &signatures).unwrap();
    assert_eq!(first.download.fetched, 3);

    let second = run(archive.config(&temp, &["hello"]), &signatures).unwrap();
    assert_eq!(second.download.fetched, 0);
    assert_eq!(second.download.cached, 3);
    assert_eq!(second.download.files, first.download.files);

    for mock in &archive.debs {
        mock.assert();
    }
}

#[test]
fn test_sync_reports_stale_packages() {
    let mut archive = FakeArchive::new(archive_packages(), "good");
    archive.serve_packages(1);
    let temp = TempDir::new().unwrap();
    let packages = temp.path().join("packages");
    fs::create_dir_all(&packages).unwrap();
    fs::write(packages.join("hello_2.9-1_amd64.deb"), b"old").unwrap();

    let report = run(archive.config(&temp, &["hello"]), &Arc::default()).unwrap();

    assert_eq!(report.stale, vec!["hello_2.9-1_amd64.deb"]);
    assert!(packages.join("hello_2.9-1_amd64.deb").exists());
}

#[test]
fn test_bad_signature_fails_loading() {
    let mut archive = FakeArchive::new(archive_packages(), "forged");
    archive.serve_packages(0);
    let temp = TempDir::new().unwrap();

    let err = run(archive.config(&temp, &["hello"]), &Arc::default()).unwrap_err();

    match err {
        Error::LoadError(inner) => {
            assert!(matches!(*inner, Error::GpgVerificationFailed(_)), "{inner}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!temp.path().join("lists").join(FILES_FILE).exists());
}

#[test]
fn test_unknown_package_fails_selection() {
    let mut archive = FakeArchive::new(archive_packages(), "good");
    archive.serve_packages(0);
    let temp = TempDir::new().unwrap();

    let err = run(archive.config(&temp, &["no-such-package"]), &Arc::default()).unwrap_err();

    assert_eq!(
        err,
        Error::NotFoundError("Package \"no-such-package\" not found".to_string())
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("lists").join(ESSENTIAL_SET_FILE)).unwrap(),
        "base-files\n"
    );
}

#[test]
fn test_missing_package_file_is_reported() {
    let packages = archive_packages();
    let mut archive = FakeArchive::new(packages, "good");
    // libc6 is listed but not served
    for package in archive.packages.clone() {
        if package.name != "libc6" {
            let mock = archive
                .server
                .mock("GET", format!("/debian/{}", package.pool_path()).as_str())
                .with_body(&package.content)
                .create();
            archive.debs.push(mock);
        }
    }
    let _missing = archive
        .server
        .mock("GET", "/debian/pool/main/libc6_2.36-9_amd64.deb")
        .with_status(404)
        .create();
    let temp = TempDir::new().unwrap();

    let report = run(archive.config(&temp, &["hello"]), &Arc::default()).unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.download.failed.len(), 1);
    assert_eq!(report.download.failed[0].0, "libc6_2.36-9_amd64.deb");
    assert!(matches!(
        report.download.failed[0].1,
        Error::UnexpectedStatus { status: 404, .. }
    ));
    assert_eq!(report.download.files.len(), 3);
}

#[test]
fn test_sync_direct_layout_per_architecture() {
    let mut server = Server::new();
    let amd64 = FakePackage::new("p-amd64", "1", "amd64").depends("p-all");
    let all = FakePackage::new("p-all", "1", "all").essential();

    let mut mocks = Vec::new();
    for (dir, package) in [("amd64", &amd64), ("all", &all)] {
        let index = packages_text(std::slice::from_ref(package));
        let release = release_text(&[("Packages", index.as_bytes())]);
        let base = format!("/repo/D/{dir}");
        for (path, body) in [
            (format!("{base}/Release"), release.into_bytes()),
            (format!("{base}/Release.gpg"), b"good".to_vec()),
            (format!("{base}/Packages"), index.into_bytes()),
            (format!("{base}/{}", package.pool_path()), package.content.clone()),
        ] {
            mocks.push(server.mock("GET", path.as_str()).with_body(body).create());
        }
    }

    let temp = TempDir::new().unwrap();
    let yaml = format!(
        "\
architectures: [amd64]
system-keyrings: false
sources:
  - deb {}/repo D/$(ARCH)/
base-packages: []
extra-packages: [p-amd64]
",
        server.url()
    );
    let config = Config::parse(&yaml, temp.path()).unwrap();
    let signatures = Arc::new(FakeSignatures::default());

    let report = run(config, &signatures).unwrap();

    assert!(report.is_complete());
    assert_eq!(report.essential_set, vec!["p-all"]);
    assert_eq!(
        report.download.files,
        vec!["p-all_1_all.deb", "p-amd64_1_amd64.deb"]
    );
    assert_eq!(report.download.fetched, 2);
    assert_eq!(signatures.calls(), 2);
    assert_eq!(
        fs::read(temp.path().join("packages").join(all.deb_filename())).unwrap(),
        all.content
    );
    for mock in &mocks {
        mock.assert();
    }
}
