// tests/integration_test.rs

//! Integration tests for pkgpool
//!
//! Each test drives a base directory through several commands, one `Session`
//! per command, the way the CLI does.

use pkgpool::delta::{DeltaGenerator, DeltaRequest, ZstdDeltaGenerator, apply_delta};
use pkgpool::packages::{MetadataReader, PackageMetadata};
use pkgpool::repository::index::XmlIndexer;
use pkgpool::{Error, Result, Session};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Package files in these tests start with a JSON metadata document
struct JsonHeaderReader;

impl MetadataReader for JsonHeaderReader {
    fn read(&self, path: &Path) -> Result<PackageMetadata> {
        let bytes = fs::read(path).map_err(|e| Error::MetadataError(e.to_string()))?;
        serde_json::Deserializer::from_slice(&bytes)
            .into_iter::<PackageMetadata>()
            .next()
            .ok_or_else(|| Error::MetadataError(format!("{} is empty", path.display())))?
            .map_err(|e| Error::MetadataError(e.to_string()))
    }
}

/// Real zstd deltas, counting how often generation actually runs
#[derive(Clone)]
struct CountingGenerator {
    inner: ZstdDeltaGenerator,
    calls: Arc<AtomicUsize>,
}

impl DeltaGenerator for CountingGenerator {
    fn generate(&self, request: &DeltaRequest<'_>) -> Result<Vec<PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(request)
    }
}

struct Env {
    dir: tempfile::TempDir,
    calls: Arc<AtomicUsize>,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn base(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    fn session(&self) -> Session {
        Session::new(
            self.base(),
            Box::new(JsonHeaderReader),
            Box::new(CountingGenerator {
                inner: ZstdDeltaGenerator::new(3),
                calls: self.calls.clone(),
            }),
            Box::new(XmlIndexer),
        )
    }

    fn generated(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Run one command in a fresh session and finish it
    fn run<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = self.session();
        let out = f(&mut session)?;
        session.finish()?;
        Ok(out)
    }

    /// Write a package file outside the tree
    fn package(&self, source: &str, name: &str, release: u32) -> PathBuf {
        let incoming = self.dir.path().join("incoming");
        fs::create_dir_all(&incoming).unwrap();
        let path = incoming.join(format!("{}-1.0-{}-1-x86_64.eopkg", name, release));

        let meta = PackageMetadata {
            name: name.to_string(),
            source: source.to_string(),
            version: "1.0".to_string(),
            release,
            architecture: "x86_64".to_string(),
            distribution_release: "1".to_string(),
        };
        let mut content = serde_json::to_vec(&meta).unwrap();
        content.push(b'\n');
        for i in 0..2000 {
            content.extend_from_slice(format!("/usr/share/{}/file-{}\n", name, i).as_bytes());
        }
        content.extend_from_slice(format!("release {}\n", release).as_bytes());
        fs::write(&path, content).unwrap();
        path
    }

    fn target(&self, repo: &str, source: &str, filename: &str) -> PathBuf {
        self.session().layout().target_path(repo, source, filename)
    }

    fn pool_path(&self, filename: &str) -> PathBuf {
        self.base().join("pool").join(filename)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

fn inode(path: &Path) -> u64 {
    fs::metadata(path).unwrap().ino()
}

fn releases(env: &Env, repo: &str, source: &str) -> Vec<u32> {
    let mut session = env.session();
    let db = session.database(repo).unwrap();
    let mut rels: Vec<u32> = db
        .lookup(source)
        .map(|pkgs| pkgs.iter().map(|a| a.release).collect())
        .unwrap_or_default();
    rels.sort_unstable();
    rels
}

#[test]
fn test_add_links_pool_and_records_artifact() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();

    let nano = env.package("nano", "nano", 5);
    let libzip = env.package("libzip", "libzip", 2);
    let report = env
        .run(|s| s.add_artifacts("unstable", &[nano.clone(), libzip.clone()]))
        .unwrap();
    assert_eq!(report.added.len(), 2);

    let nano_target = env.target("unstable", "nano", &file_name(&nano));
    let libzip_target = env.target("unstable", "libzip", &file_name(&libzip));
    assert!(nano_target.starts_with(env.base().join("unstable/n/nano")));
    assert!(libzip_target.starts_with(env.base().join("unstable/libz/libzip")));
    assert_eq!(inode(&nano_target), inode(&env.pool_path(&file_name(&nano))));
    assert_eq!(fs::read(&nano_target).unwrap(), fs::read(&nano).unwrap());

    // Persisted and indexed
    assert_eq!(releases(&env, "unstable", "nano"), vec![5]);
    let index = fs::read_to_string(env.base().join("unstable/eopkg-index.xml")).unwrap();
    assert!(index.contains("<PackageURI>libz/libzip/libzip-1.0-2-1-x86_64.eopkg</PackageURI>"));
    assert!(env.base().join("unstable/eopkg-index.xml.xz").exists());
}

#[test]
fn test_add_is_idempotent() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    let nano = env.package("nano", "nano", 5);

    env.run(|s| s.add_artifacts("unstable", &[nano.clone()])).unwrap();
    let report = env.run(|s| s.add_artifacts("unstable", &[nano.clone()])).unwrap();

    assert!(report.added.is_empty());
    assert_eq!(report.already_present, vec![file_name(&nano)]);
    let mut session = env.session();
    assert_eq!(session.database("unstable").unwrap().len(), 1);
}

#[test]
fn test_pool_file_survives_until_last_reference() {
    let env = Env::new();
    env.run(|s| s.create_repository("a")).unwrap();
    env.run(|s| s.create_repository("b")).unwrap();
    let nano = env.package("nano", "nano", 5);
    let pooled = env.pool_path(&file_name(&nano));

    env.run(|s| s.add_artifacts("a", &[nano.clone()])).unwrap();
    env.run(|s| s.add_artifacts("b", &[nano.clone()])).unwrap();
    assert_eq!(
        inode(&env.target("a", "nano", &file_name(&nano))),
        inode(&env.target("b", "nano", &file_name(&nano)))
    );

    env.run(|s| s.remove_sources("a", &["nano".parse().unwrap()])).unwrap();
    assert!(pooled.exists());
    assert!(!env.base().join("a/n").exists());

    env.run(|s| s.remove_sources("b", &["nano".parse().unwrap()])).unwrap();
    assert!(!pooled.exists());
}

#[test]
fn test_remove_source_pinned_release() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    let pkgs = [
        env.package("nano", "nano", 3),
        env.package("nano", "nano", 5),
    ];
    env.run(|s| s.add_artifacts("unstable", &pkgs)).unwrap();

    let removed = env
        .run(|s| s.remove_sources("unstable", &["nano==5".parse().unwrap()]))
        .unwrap();
    assert_eq!(removed, vec![file_name(&pkgs[1])]);
    assert_eq!(releases(&env, "unstable", "nano"), vec![3]);
    assert!(!env.pool_path(&file_name(&pkgs[1])).exists());

    env.run(|s| s.remove_sources("unstable", &["nano==3".parse().unwrap()]))
        .unwrap();
    let mut session = env.session();
    assert!(!session.database("unstable").unwrap().contains_source("nano"));
}

#[test]
fn test_delta_is_generated_once_and_shared() {
    let env = Env::new();
    env.run(|s| s.create_repository("a")).unwrap();
    let old = env.package("nano", "nano", 3);
    let new = env.package("nano", "nano", 5);
    env.run(|s| s.add_artifacts("a", &[old.clone(), new.clone()])).unwrap();

    let report = env.run(|s| s.delta("a")).unwrap();
    let delta = "nano-3-5-1-x86_64.delta.eopkg";
    assert_eq!(report.linked, vec![delta.to_string()]);
    assert_eq!(env.generated(), 1);

    // Re-running is a no-op
    let report = env.run(|s| s.delta("a")).unwrap();
    assert!(!report.changed());
    assert_eq!(env.generated(), 1);

    // A second repository reuses the pooled delta
    env.run(|s| s.clone_repository("a", "b", true)).unwrap();
    env.run(|s| s.delta("b")).unwrap();
    assert_eq!(env.generated(), 1);
    assert_eq!(
        inode(&env.target("a", "nano", delta)),
        inode(&env.target("b", "nano", delta))
    );

    // The delta rebuilds the new package from the old one
    let rebuilt = env.dir.path().join("rebuilt.eopkg");
    apply_delta(&old, &env.pool_path(delta), &rebuilt).unwrap();
    assert_eq!(fs::read(&rebuilt).unwrap(), fs::read(&new).unwrap());

    let index = fs::read_to_string(env.base().join("b/eopkg-index.xml")).unwrap();
    assert!(index.contains("releaseFrom=\"3\""));
}

#[test]
fn test_removing_delta_endpoint_invalidates_delta() {
    let env = Env::new();
    env.run(|s| s.create_repository("a")).unwrap();
    let pkgs = [
        env.package("nano", "nano", 3),
        env.package("nano", "nano", 4),
        env.package("nano", "nano", 5),
    ];
    env.run(|s| s.add_artifacts("a", &pkgs)).unwrap();
    env.run(|s| s.delta("a")).unwrap();
    assert_eq!(env.generated(), 2);

    env.run(|s| s.remove_sources("a", &["nano==5".parse().unwrap()]))
        .unwrap();

    assert!(!env.target("a", "nano", "nano-3-5-1-x86_64.delta.eopkg").exists());
    assert!(!env.pool_path("nano-3-5-1-x86_64.delta.eopkg").exists());
    assert!(env.target("a", "nano", "nano-3-4-1-x86_64.delta.eopkg").exists());
    assert_eq!(env.generated(), 3);
}

#[test]
fn test_clone_copies_latest_release_only() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    let pkgs = [
        env.package("nano", "nano", 3),
        env.package("nano", "nano", 5),
        env.package("zlib", "zlib", 1),
    ];
    env.run(|s| s.add_artifacts("unstable", &pkgs)).unwrap();

    let report = env.run(|s| s.clone_repository("unstable", "stable", false)).unwrap();
    assert_eq!(report.copied.len(), 2);
    assert_eq!(releases(&env, "stable", "nano"), vec![5]);
    assert_eq!(releases(&env, "stable", "zlib"), vec![1]);

    env.run(|s| s.clone_repository("unstable", "full", true)).unwrap();
    assert_eq!(releases(&env, "full", "nano"), vec![3, 5]);

    let exists = env.run(|s| s.clone_repository("unstable", "stable", false));
    assert!(matches!(exists, Err(Error::ValidationError(_))));

    let session = env.session();
    assert_eq!(
        session.list_repositories().unwrap(),
        vec!["full".to_string(), "stable".to_string(), "unstable".to_string()]
    );
}

#[test]
fn test_clone_empty_repository_fails() {
    let env = Env::new();
    env.run(|s| s.create_repository("empty")).unwrap();
    let result = env.run(|s| s.clone_repository("empty", "copy", false));
    assert!(matches!(result, Err(Error::ValidationError(_))));
    assert!(!env.base().join("copy").exists());
}

#[test]
fn test_copy_sources() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    env.run(|s| s.create_repository("stable")).unwrap();
    let pkgs = [
        env.package("nano", "nano", 3),
        env.package("nano", "nano", 5),
        env.package("zlib", "zlib", 1),
    ];
    env.run(|s| s.add_artifacts("unstable", &pkgs)).unwrap();

    let report = env
        .run(|s| s.copy_sources("unstable", "stable", &["nano".to_string()], false))
        .unwrap();
    assert_eq!(report.copied, vec![file_name(&pkgs[1])]);
    assert_eq!(releases(&env, "stable", "nano"), vec![5]);
    assert!(releases(&env, "stable", "zlib").is_empty());

    // Existing targets are skipped
    let report = env
        .run(|s| s.copy_sources("unstable", "stable", &["nano".to_string()], true))
        .unwrap();
    assert_eq!(report.copied, vec![file_name(&pkgs[0])]);
    assert_eq!(report.skipped, vec![file_name(&pkgs[1])]);

    let missing = env.run(|s| s.copy_sources("unstable", "stable", &["vim".to_string()], false));
    assert!(matches!(missing, Err(Error::NotFoundError(_))));
}

#[test]
fn test_pull_brings_newer_releases() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    env.run(|s| s.add_artifacts("unstable", &[env.package("nano", "nano", 5)]))
        .unwrap();
    env.run(|s| s.clone_repository("unstable", "stable", false)).unwrap();

    env.run(|s| {
        s.add_artifacts(
            "unstable",
            &[env.package("nano", "nano", 7), env.package("zlib", "zlib", 2)],
        )
    })
    .unwrap();

    let report = env.run(|s| s.pull("stable", "unstable")).unwrap();
    assert_eq!(report.updates.len(), 2);
    let nano = report.updates.iter().find(|u| u.source == "nano").unwrap();
    assert_eq!(nano.from_release, Some(5));
    assert_eq!(nano.to_release, 7);
    let zlib = report.updates.iter().find(|u| u.source == "zlib").unwrap();
    assert_eq!(zlib.from_release, None);

    // Nothing is removed from the clone
    assert_eq!(releases(&env, "stable", "nano"), vec![5, 7]);

    let report = env.run(|s| s.pull("stable", "unstable")).unwrap();
    assert!(report.is_up_to_date());
}

#[test]
fn test_pull_ignores_older_origin() {
    let env = Env::new();
    env.run(|s| s.create_repository("old")).unwrap();
    env.run(|s| s.create_repository("new")).unwrap();
    env.run(|s| s.add_artifacts("old", &[env.package("nano", "nano", 3)]))
        .unwrap();
    env.run(|s| s.add_artifacts("new", &[env.package("nano", "nano", 5)]))
        .unwrap();

    let report = env.run(|s| s.pull("new", "old")).unwrap();
    assert!(report.is_up_to_date());
    assert_eq!(releases(&env, "new", "nano"), vec![5]);
}

#[test]
fn test_remove_repository_releases_pool() {
    let env = Env::new();
    env.run(|s| s.create_repository("a")).unwrap();
    env.run(|s| s.create_repository("b")).unwrap();
    let nano = env.package("nano", "nano", 5);
    let zlib = env.package("zlib", "zlib", 1);
    env.run(|s| s.add_artifacts("a", &[nano.clone()])).unwrap();
    env.run(|s| s.add_artifacts("b", &[nano.clone(), zlib.clone()])).unwrap();

    env.run(|s| s.remove_repository("b")).unwrap();

    assert!(!env.base().join("b").exists());
    assert!(!env.base().join("b.db").exists());
    assert!(env.pool_path(&file_name(&nano)).exists());
    assert!(!env.pool_path(&file_name(&zlib)).exists());
    assert_eq!(env.session().list_repositories().unwrap(), vec!["a".to_string()]);

    let gone = env.run(|s| s.remove_repository("b"));
    assert!(matches!(gone, Err(Error::ValidationError(_))));
}

#[test]
fn test_corrupt_database_aborts_without_changes() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    fs::write(env.base().join("unstable.db"), b"definitely not sqlite").unwrap();

    let nano = env.package("nano", "nano", 5);
    let result = env.run(|s| s.add_artifacts("unstable", &[nano.clone()]));

    assert!(matches!(result, Err(Error::PersistenceError(_))));
    assert!(!env.target("unstable", "nano", &file_name(&nano)).exists());
    assert!(!env.pool_path(&file_name(&nano)).exists());
    assert_eq!(
        fs::read(env.base().join("unstable.db")).unwrap(),
        b"definitely not sqlite"
    );
}

#[test]
fn test_verify_reports_consistency() {
    let env = Env::new();
    env.run(|s| s.create_repository("unstable")).unwrap();
    let pkgs = [
        env.package("nano", "nano", 3),
        env.package("nano", "nano", 5),
    ];
    env.run(|s| s.add_artifacts("unstable", &pkgs)).unwrap();
    env.run(|s| s.delta("unstable")).unwrap();

    let report = env.session().verify(None, true).unwrap();
    assert!(report.is_consistent(), "{:?}", report);

    // Break the tree behind the database's back
    fs::remove_file(env.target("unstable", "nano", &file_name(&pkgs[0]))).unwrap();

    let report = env.session().verify(Some("unstable"), false).unwrap();
    assert!(!report.is_consistent());
    assert_eq!(report.repositories[0].missing, vec![file_name(&pkgs[0])]);
    assert_eq!(report.orphans, vec![file_name(&pkgs[0])]);
}
