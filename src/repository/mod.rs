// src/repository/mod.rs

//! Repository management
//!
//! This module provides functionality for:
//! - Creating, listing and removing repositories
//! - Adding and removing packages, keeping pool, tree and database in step
//! - Cloning repositories and copying or pulling packages between them
//! - Regenerating deltas and indexes for repositories altered by a command
//!
//! A `Session` corresponds to one command. It caches every repository
//! database it touches, records which repositories were altered and, in
//! `finish`, regenerates invalidated deltas and rebuilds each altered
//! repository's index exactly once.

pub mod check;
pub mod index;
pub mod layout;
pub mod lock;

use crate::config::Config;
use crate::db::RepoDatabase;
use crate::db::models::{Artifact, SourceSpec};
use crate::delta::{DeltaGenerator, DeltaManager, ReconcileReport, ZstdDeltaGenerator, stale_deltas};
use crate::error::{Error, Result};
use crate::packages::{
    CommandMetadataReader, MetadataReader, PACKAGE_SUFFIX, is_delta_name,
};
use crate::pool::{Pool, sha256_file};
use check::{ConsistencyReport, check_repository};
use index::{Indexer, XmlIndexer};
use layout::{INDEX_PREFIX, Layout};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Garbage-collect the pooled `filename` of `source` against every repository
pub fn collect_garbage(layout: &Layout, pool: &Pool, source: &str, filename: &str) -> Result<bool> {
    let repos = layout.list_repositories()?;
    pool.garbage_collect(
        filename,
        repos.iter().map(|repo| layout.target_path(repo, source, filename)),
    )
}

/// Where the bytes of an artifact being linked come from
#[derive(Debug, Clone, Copy)]
enum Origin<'a> {
    /// A file outside the tree, pooled on demand
    External(&'a Path),
    /// Another repository; the file must already be pooled
    Pooled,
}

/// How an artifact removal treats delta bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Record invalidated deltas for regeneration
    Tracked,
    /// Full repository teardown, nothing is regenerated
    Teardown,
}

/// Result of adding package files
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddReport {
    pub added: Vec<String>,
    /// Files already present in the repository
    pub already_present: Vec<String>,
    /// Delta packages, which are never added directly
    pub deltas_skipped: Vec<String>,
}

/// Result of copying packages between repositories
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: Vec<String>,
    /// Artifacts already present at the destination
    pub skipped: Vec<String>,
}

/// One source updated by a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullUpdate {
    pub source: String,
    /// Highest release in the clone before the pull, if the source existed
    pub from_release: Option<u32>,
    pub to_release: u32,
    pub version: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub updates: Vec<PullUpdate>,
}

impl PullReport {
    pub fn is_up_to_date(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Result of `verify`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub repositories: Vec<ConsistencyReport>,
    /// Pool files not linked by any repository
    pub orphans: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphans.is_empty() && self.repositories.iter().all(ConsistencyReport::is_consistent)
    }
}

/// State of one repository command
pub struct Session {
    layout: Layout,
    pool: Pool,
    reader: Box<dyn MetadataReader>,
    generator: Box<dyn DeltaGenerator>,
    indexer: Box<dyn Indexer>,
    databases: HashMap<String, RepoDatabase>,
    altered: Vec<String>,
    need_delta: BTreeMap<String, BTreeSet<String>>,
}

impl Session {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        reader: Box<dyn MetadataReader>,
        generator: Box<dyn DeltaGenerator>,
        indexer: Box<dyn Indexer>,
    ) -> Self {
        let layout = Layout::new(base_dir);
        let pool = Pool::new(layout.pool_dir());
        Self {
            layout,
            pool,
            reader,
            generator,
            indexer,
            databases: HashMap::new(),
            altered: Vec::new(),
            need_delta: BTreeMap::new(),
        }
    }

    /// Session wired with the default collaborators for `config`
    pub fn from_config(config: &Config) -> Self {
        let reader = CommandMetadataReader::new(config.metadata_tool.clone())
            .with_args(config.metadata_args.clone());
        Self::new(
            config.base_dir.clone(),
            Box::new(reader),
            Box::new(ZstdDeltaGenerator::new(config.delta_level)),
            Box::new(XmlIndexer),
        )
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Repositories altered so far, in the order they were first touched
    pub fn altered(&self) -> &[String] {
        &self.altered
    }

    /// Sources of `repo` whose deltas were invalidated during this session
    pub fn pending_deltas(&self, repo: &str) -> Vec<&str> {
        self.need_delta
            .get(repo)
            .map(|sources| sources.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn mark_altered(&mut self, repo: &str) {
        if !self.altered.iter().any(|r| r == repo) {
            self.altered.push(repo.to_string());
        }
    }

    fn require_repo(&self, repo: &str) -> Result<()> {
        if !self.layout.is_repo(repo) {
            return Err(Error::ValidationError(format!(
                "{} is not a valid repository",
                repo
            )));
        }
        Ok(())
    }

    fn database_mut(&mut self, repo: &str) -> Result<&mut RepoDatabase> {
        match self.databases.entry(repo.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let db = RepoDatabase::load(&self.layout.db_path(repo))?;
                Ok(entry.insert(db))
            }
        }
    }

    /// Database of `repo`, loaded on first access and cached for the session
    pub fn database(&mut self, repo: &str) -> Result<&RepoDatabase> {
        self.database_mut(repo).map(|db| &*db)
    }

    /// Persist the cached database of `repo`, if it was loaded
    pub fn save_database(&self, repo: &str) -> Result<()> {
        match self.databases.get(repo) {
            Some(db) => db.save(&self.layout.db_path(repo)),
            None => Ok(()),
        }
    }

    /// Create a new, empty repository
    pub fn create_repository(&mut self, name: &str) -> Result<()> {
        Layout::validate_repo_name(name)?;

        if self.layout.is_repo(name) {
            return Err(Error::ValidationError(format!(
                "{} already exists - aborting",
                name
            )));
        }
        let repo_dir = self.layout.repo_dir(name);
        if repo_dir.exists() {
            return Err(Error::ValidationError(format!(
                "{} exists and is not a repo",
                repo_dir.display()
            )));
        }
        let db_path = self.layout.db_path(name);
        if db_path.exists() {
            return Err(Error::ConflictError(format!(
                "Stale database {} exists for {}",
                db_path.display(),
                name
            )));
        }

        fs::create_dir_all(&repo_dir).map_err(|e| Error::io("Unable to create repo", &repo_dir, e))?;
        let sentinel = self.layout.sentinel(name);
        File::create(&sentinel).map_err(|e| Error::io("Unable to create repo", &sentinel, e))?;

        self.databases.insert(name.to_string(), RepoDatabase::new());
        self.save_database(name)?;

        info!("Created repository: {}", name);
        Ok(())
    }

    /// Remove a repository and every reference it holds on the pool
    pub fn remove_repository(&mut self, name: &str) -> Result<()> {
        self.require_repo(name)?;

        let artifacts: Vec<Artifact> = self.database(name)?.artifacts().cloned().collect();
        for artifact in &artifacts {
            debug!("Evacuating {} from {}", artifact.filename, name);
            self.remove_artifact(name, artifact, Removal::Teardown)?;
        }

        let repo_dir = self.layout.repo_dir(name);
        self.sweep_leftovers(&repo_dir)?;

        let sentinel = self.layout.sentinel(name);
        fs::remove_file(&sentinel).map_err(|e| Error::io("Unable to delete", &sentinel, e))?;

        let pattern = format!(
            "{}/{}*",
            glob::Pattern::escape(&repo_dir.to_string_lossy()),
            INDEX_PREFIX
        );
        let index_files = glob::glob(&pattern)
            .map_err(|e| Error::ValidationError(format!("Bad pattern {}: {}", pattern, e)))?;
        for index_file in index_files.flatten() {
            fs::remove_file(&index_file).map_err(|e| Error::io("Unable to delete", &index_file, e))?;
        }

        fs::remove_dir_all(&repo_dir)
            .map_err(|e| Error::io("Unable to delete repo directory", &repo_dir, e))?;

        self.databases.remove(name);
        self.altered.retain(|r| r != name);
        self.need_delta.remove(name);

        let db_path = self.layout.db_path(name);
        match fs::remove_file(&db_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("Unable to delete", &db_path, e)),
        }

        info!("Successfully removed repository: {}", name);
        Ok(())
    }

    /// Unlink files left in a repository tree after its artifacts were removed
    fn sweep_leftovers(&self, repo_dir: &Path) -> Result<()> {
        let leftovers: Vec<PathBuf> = WalkDir::new(repo_dir)
            .min_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        for path in leftovers {
            warn!("Removing leftover file: {}", path.display());
            fs::remove_file(&path).map_err(|e| Error::io("Unable to remove", &path, e))?;

            let source = path.parent().and_then(Path::file_name).map(|s| s.to_string_lossy());
            let filename = path.file_name().map(|s| s.to_string_lossy());
            if let (Some(source), Some(filename)) = (source, filename) {
                collect_garbage(&self.layout, &self.pool, &source, &filename)?;
            }
        }
        Ok(())
    }

    /// Add package files to a repository
    ///
    /// Files already present at their target are reported, delta packages are
    /// skipped. The first failure aborts the batch; packages added before it
    /// are persisted.
    pub fn add_artifacts(&mut self, repo: &str, paths: &[PathBuf]) -> Result<AddReport> {
        self.require_repo(repo)?;

        if paths.is_empty() {
            return Err(Error::ValidationError("No packages specified".to_string()));
        }

        let invalids: Vec<String> = paths
            .iter()
            .filter(|p| !p.is_file() || !p.to_string_lossy().ends_with(PACKAGE_SUFFIX))
            .map(|p| p.file_name().unwrap_or(p.as_os_str()).to_string_lossy().into_owned())
            .collect();
        if !invalids.is_empty() {
            return Err(Error::ValidationError(format!(
                "Invalid or missing: {}",
                invalids.join(", ")
            )));
        }

        // Fail on an unreadable database before touching the tree
        self.database_mut(repo)?;

        let mut report = AddReport::default();
        for path in paths {
            let filename = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };

            if is_delta_name(&filename) {
                info!("Skipping delta: {}", filename);
                report.deltas_skipped.push(filename);
                continue;
            }

            match self.add_one(repo, path, &filename) {
                Ok(true) => report.added.push(filename),
                Ok(false) => report.already_present.push(filename),
                Err(e) => {
                    error!("Aborting due to failed add of {}", path.display());
                    self.save_database(repo)?;
                    return Err(e);
                }
            }
        }

        self.save_database(repo)?;
        Ok(report)
    }

    fn add_one(&mut self, repo: &str, path: &Path, filename: &str) -> Result<bool> {
        let meta = self.reader.read(path)?;
        let mut artifact = Artifact::from_metadata(meta, filename.to_string())?;

        if self.layout.artifact_target(repo, &artifact).exists() {
            info!("{} already in repo", filename);
            return Ok(false);
        }

        info!("Adding to {}: {}", repo, path.display());
        artifact.sha256 = Some(sha256_file(path)?);
        self.link_artifact(repo, artifact, Origin::External(path))?;
        Ok(true)
    }

    /// Pool (if needed) and link an artifact into `repo`, then record it
    fn link_artifact(&mut self, repo: &str, artifact: Artifact, origin: Origin<'_>) -> Result<()> {
        let target = self.layout.artifact_target(repo, &artifact);
        if target.exists() {
            return Err(Error::ConflictError(format!(
                "{} already exists",
                target.display()
            )));
        }

        let adopted = !self.pool.is_pooled(&artifact.filename);
        if !adopted {
            if let (Origin::External(_), Some(expected)) = (origin, &artifact.sha256) {
                let pooled = self.pool.path_for(&artifact.filename);
                let actual = sha256_file(&pooled)?;
                if &actual != expected {
                    return Err(Error::ChecksumMismatch {
                        path: pooled,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            info!("Using {} from pool", artifact.filename);
        } else {
            match origin {
                Origin::External(path) => {
                    self.pool.adopt(path, &artifact.filename)?;
                }
                Origin::Pooled => {
                    return Err(Error::ConflictError(format!(
                        "Local package not pooled: {}",
                        artifact.filename
                    )));
                }
            }
        }

        if let Err(e) = self.pool.link_into(&artifact.filename, &target) {
            // Nothing links the file this call pooled
            if adopted {
                collect_garbage(&self.layout, &self.pool, &artifact.source_name, &artifact.filename)?;
            }
            return Err(e);
        }
        info!("Imported {}", artifact.filename);

        self.database_mut(repo)?.append(artifact);
        self.mark_altered(repo);
        Ok(())
    }

    /// Unlink an artifact from `repo`, invalidate its deltas and collect its
    /// pool file if nothing references it any more
    fn remove_artifact(&mut self, repo: &str, artifact: &Artifact, removal: Removal) -> Result<()> {
        let target = self.layout.artifact_target(repo, artifact);
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} was already missing", target.display());
            }
            Err(e) => return Err(Error::io("Unable to remove package", &target, e)),
        }
        self.database_mut(repo)?.remove(artifact);

        let source_dir = self.layout.source_dir(repo, &artifact.source_name);
        for kill in stale_deltas(&source_dir, artifact)? {
            info!("Removing invalid delta: {}", kill.display());
            fs::remove_file(&kill).map_err(|e| Error::io("Unable to remove", &kill, e))?;

            if removal == Removal::Tracked {
                self.need_delta
                    .entry(repo.to_string())
                    .or_default()
                    .insert(artifact.source_name.clone());
            }

            if let Some(name) = kill.file_name() {
                collect_garbage(&self.layout, &self.pool, &artifact.source_name, &name.to_string_lossy())?;
            }
        }

        self.remove_empty_dirs(repo, &source_dir)?;
        collect_garbage(&self.layout, &self.pool, &artifact.source_name, &artifact.filename)?;
        Ok(())
    }

    /// Remove `dir` and its parents while they are empty, stopping at the repository root
    fn remove_empty_dirs(&self, repo: &str, dir: &Path) -> Result<()> {
        let repo_dir = self.layout.repo_dir(repo);
        let mut current = dir.to_path_buf();

        while current != repo_dir && current.starts_with(&repo_dir) {
            let empty = match fs::read_dir(&current) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(Error::io("Failed to read", &current, e)),
            };
            if !empty {
                break;
            }

            info!("Removing package directory: {}", current.display());
            fs::remove_dir(&current).map_err(|e| Error::io("Unable to remove", &current, e))?;
            if !current.pop() {
                break;
            }
        }
        Ok(())
    }

    /// Remove packages by source name, optionally pinned to one release
    pub fn remove_sources(&mut self, repo: &str, specs: &[SourceSpec]) -> Result<Vec<String>> {
        if specs.is_empty() {
            return Err(Error::ValidationError(
                "Requires at least one source name".to_string(),
            ));
        }
        self.require_repo(repo)?;

        let mut removals: Vec<Artifact> = Vec::new();
        {
            let db = self.database(repo)?;
            for spec in specs {
                let pkgs = db.lookup(&spec.name).ok_or_else(|| {
                    Error::NotFoundError(format!("{} does not exist in {} repo", spec.name, repo))
                })?;
                let matches: Vec<&Artifact> = pkgs
                    .iter()
                    .filter(|a| spec.release.is_none_or(|rel| a.release == rel))
                    .collect();
                if matches.is_empty() {
                    return Err(Error::NotFoundError(format!("No matches found for {}", spec)));
                }
                for artifact in matches {
                    if !removals.iter().any(|r| r.same_identity(artifact)) {
                        removals.push(artifact.clone());
                    }
                }
            }
        }

        self.mark_altered(repo);
        let mut removed = Vec::new();
        for artifact in &removals {
            if let Err(e) = self.remove_artifact(repo, artifact, Removal::Tracked) {
                self.save_database(repo)?;
                return Err(e);
            }
            info!("Removed {} from {}", artifact.filename, repo);
            removed.push(artifact.filename.clone());
        }

        self.save_database(repo)?;
        Ok(removed)
    }

    /// Reconcile the deltas of every source in `repo`
    pub fn delta(&mut self, repo: &str) -> Result<ReconcileReport> {
        self.require_repo(repo)?;

        let sources: Vec<String> = self.database(repo)?.source_names().map(String::from).collect();
        if sources.is_empty() {
            info!("No packages found in {}", repo);
            return Ok(ReconcileReport::default());
        }

        let mut report = ReconcileReport::default();
        for source in &sources {
            let outcome = self.reconcile(repo, source)?;
            report.linked.extend(outcome.linked);
            report.pruned.extend(outcome.pruned);
        }

        if report.changed() {
            self.mark_altered(repo);
        }
        Ok(report)
    }

    fn reconcile(&mut self, repo: &str, source: &str) -> Result<ReconcileReport> {
        self.database_mut(repo)?;
        let Some(artifacts) = self.databases.get(repo).and_then(|db| db.lookup(source)) else {
            return Ok(ReconcileReport::default());
        };

        let manager = DeltaManager {
            layout: &self.layout,
            pool: &self.pool,
            generator: self.generator.as_ref(),
        };
        manager.reconcile(repo, source, artifacts)
    }

    /// Copy the artifacts of one source group from `src` to `dest`
    fn copy_group(
        &mut self,
        src: &str,
        dest: &str,
        source: &str,
        all_versions: bool,
        report: &mut CopyReport,
    ) -> Result<()> {
        let copies: Vec<Artifact> = {
            let db = self.database(src)?;
            if all_versions {
                db.get(source)?.to_vec()
            } else {
                db.latest(source).into_iter().cloned().collect()
            }
        };

        for copy in copies {
            if self.layout.artifact_target(dest, &copy).exists() {
                info!("Skipping inclusion of already included {}", copy.package_name);
                report.skipped.push(copy.filename);
                continue;
            }
            let filename = copy.filename.clone();
            self.link_artifact(dest, copy, Origin::Pooled)?;
            report.copied.push(filename);
        }
        Ok(())
    }

    fn copy_groups(
        &mut self,
        src: &str,
        dest: &str,
        sources: &[String],
        all_versions: bool,
    ) -> Result<CopyReport> {
        self.database_mut(dest)?;

        let mut report = CopyReport::default();
        for source in sources {
            if let Err(e) = self.copy_group(src, dest, source, all_versions, &mut report) {
                self.save_database(dest)?;
                return Err(e);
            }
        }
        self.mark_altered(dest);
        self.save_database(dest)?;
        Ok(report)
    }

    /// Create `dest` as a snapshot of `src`
    ///
    /// Only the highest release of every source is copied unless
    /// `all_versions` is set.
    pub fn clone_repository(&mut self, src: &str, dest: &str, all_versions: bool) -> Result<CopyReport> {
        self.require_repo(src)?;
        Layout::validate_repo_name(dest)?;
        if self.layout.repo_dir(dest).exists() {
            return Err(Error::ValidationError(format!("{} exists - aborting", dest)));
        }

        let sources: Vec<String> = self.database(src)?.source_names().map(String::from).collect();
        if sources.is_empty() {
            return Err(Error::ValidationError(format!("{} is empty, cannot clone", src)));
        }

        self.create_repository(dest)?;
        let report = self.copy_groups(src, dest, &sources, all_versions)?;
        info!("Cloned {} into {} ({} packages)", src, dest, report.copied.len());
        Ok(report)
    }

    /// Copy named sources from `src` into the existing repository `dest`
    pub fn copy_sources(
        &mut self,
        src: &str,
        dest: &str,
        names: &[String],
        all_versions: bool,
    ) -> Result<CopyReport> {
        if names.is_empty() {
            return Err(Error::ValidationError(
                "Requires at least one source name".to_string(),
            ));
        }
        self.require_repo(src)?;
        self.require_repo(dest)?;

        let db = self.database(src)?;
        if let Some(missing) = names.iter().find(|n| !db.contains_source(n)) {
            return Err(Error::NotFoundError(format!(
                "{} does not exist in {} repo",
                missing, src
            )));
        }

        self.copy_groups(src, dest, names, all_versions)
    }

    /// Bring `clone` up to date with newer releases from `origin`
    ///
    /// Sources missing from the clone are copied; sources present in both are
    /// updated only if the origin carries a strictly higher release. Nothing
    /// is ever removed from the clone.
    pub fn pull(&mut self, clone: &str, origin: &str) -> Result<PullReport> {
        if !self.layout.is_repo(origin) {
            return Err(Error::ValidationError(format!("Origin {} does not exist", origin)));
        }
        if !self.layout.is_repo(clone) {
            return Err(Error::ValidationError(format!("Clone {} does not exist", clone)));
        }

        self.database_mut(clone)?;
        let candidates: Vec<(String, Vec<Artifact>)> = {
            let db = self.database(origin)?;
            db.source_names()
                .map(|s| (s.to_string(), db.latest(s).into_iter().cloned().collect()))
                .collect()
        };

        let mut report = PullReport::default();
        for (source, latest) in candidates {
            let Some(newest) = latest.first() else {
                continue;
            };
            let (to_release, version) = (newest.release, newest.version.clone());

            let current = self.database(clone)?.max_release(&source);
            match current {
                Some(rel) if rel >= to_release => continue,
                Some(rel) => info!("Updating {} from release {} to {}-{}", source, rel, version, to_release),
                None => info!("Pulling new package source: {}", source),
            }

            for artifact in latest {
                if self.layout.artifact_target(clone, &artifact).exists() {
                    continue;
                }
                if let Err(e) = self.link_artifact(clone, artifact, Origin::Pooled) {
                    self.save_database(clone)?;
                    return Err(e);
                }
            }

            report.updates.push(PullUpdate {
                source,
                from_release: current,
                to_release,
                version,
            });
        }

        if report.is_up_to_date() {
            info!("Everything up to date");
        } else {
            self.save_database(clone)?;
        }
        Ok(report)
    }

    /// Names of all repositories under the base directory
    pub fn list_repositories(&self) -> Result<Vec<String>> {
        self.layout.list_repositories()
    }

    /// Check repositories against their databases and the pool for orphans
    pub fn verify(&mut self, repo: Option<&str>, checksums: bool) -> Result<VerifyReport> {
        let repos = match repo {
            Some(name) => {
                self.require_repo(name)?;
                vec![name.to_string()]
            }
            None => self.layout.list_repositories()?,
        };

        let mut report = VerifyReport::default();
        for name in &repos {
            self.database_mut(name)?;
            let Some(db) = self.databases.get(name) else {
                continue;
            };
            report
                .repositories
                .push(check_repository(&self.layout, &self.pool, name, db, checksums)?);
        }
        report.orphans = self.pool.orphans()?;
        Ok(report)
    }

    /// Complete the command
    ///
    /// For every altered repository, regenerate invalidated deltas, rebuild
    /// the index once and persist the database. Returns the written index
    /// paths.
    pub fn finish(&mut self) -> Result<Vec<PathBuf>> {
        let altered = std::mem::take(&mut self.altered);
        if !altered.is_empty() {
            info!("Updating altered repositories");
        }

        let mut indexes = Vec::new();
        for repo in &altered {
            if !self.layout.is_repo(repo) {
                warn!("{} is not a valid repo", repo);
                continue;
            }

            if let Some(sources) = self.need_delta.remove(repo) {
                info!("Reproducing deltas due to invalidation in {}", repo);
                for source in &sources {
                    self.reconcile(repo, source)?;
                }
            }

            self.database_mut(repo)?;
            if let Some(db) = self.databases.get(repo) {
                indexes.push(self.indexer.build_index(&self.layout.repo_dir(repo), db)?);
            }
            self.save_database(repo)?;
        }

        Ok(indexes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageMetadata;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Reads metadata from the JSON the test wrote into the package file
    struct JsonReader;

    impl MetadataReader for JsonReader {
        fn read(&self, path: &Path) -> Result<PackageMetadata> {
            let bytes = fs::read(path).map_err(|e| Error::MetadataError(e.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|e| Error::MetadataError(e.to_string()))
        }
    }

    /// Writes a fixed delta and records each request
    #[derive(Clone, Default)]
    struct RecordingGenerator {
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl DeltaGenerator for RecordingGenerator {
        fn generate(&self, request: &crate::delta::DeltaRequest<'_>) -> Result<Vec<PathBuf>> {
            self.calls.borrow_mut().push(request.delta_name.to_string());
            let out = request.work_dir.join(request.delta_name);
            fs::write(&out, b"delta").unwrap();
            Ok(vec![out])
        }
    }

    /// Records which repositories were indexed
    #[derive(Clone, Default)]
    struct RecordingIndexer {
        indexed: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl Indexer for RecordingIndexer {
        fn build_index(&self, repo_dir: &Path, _db: &RepoDatabase) -> Result<PathBuf> {
            self.indexed.borrow_mut().push(repo_dir.to_path_buf());
            Ok(repo_dir.join("eopkg-index.xml"))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        session: Session,
        generator: RecordingGenerator,
        indexer: RecordingIndexer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let generator = RecordingGenerator::default();
        let indexer = RecordingIndexer::default();
        let session = Session::new(
            dir.path().join("repo"),
            Box::new(JsonReader),
            Box::new(generator.clone()),
            Box::new(indexer.clone()),
        );
        Fixture {
            dir,
            session,
            generator,
            indexer,
        }
    }

    fn package(dir: &Path, source: &str, name: &str, release: u32) -> PathBuf {
        let path = dir.join(format!("{}-1.0-{}-1-x86_64.eopkg", name, release));
        let meta = PackageMetadata {
            name: name.to_string(),
            source: source.to_string(),
            version: "1.0".to_string(),
            release,
            architecture: "x86_64".to_string(),
            distribution_release: "1".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&meta).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_create_repository_twice_fails() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        assert!(f.session.layout().is_repo("unstable"));
        assert!(f.session.layout().db_path("unstable").exists());

        let result = f.session.create_repository("unstable");
        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_create_repository_over_plain_directory_fails() {
        let mut f = fixture();
        fs::create_dir_all(f.session.layout().repo_dir("stuff")).unwrap();
        let result = f.session.create_repository("stuff");
        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_add_rejects_invalid_files() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        let not_a_package = f.dir.path().join("README");
        fs::write(&not_a_package, b"hi").unwrap();

        let result = f.session.add_artifacts(
            "unstable",
            &[not_a_package, f.dir.path().join("missing.eopkg")],
        );
        match result {
            Err(Error::ValidationError(msg)) => {
                assert!(msg.contains("README"));
                assert!(msg.contains("missing.eopkg"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_add_skips_deltas() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        let delta = f.dir.path().join("nano-3-5-1-x86_64.delta.eopkg");
        fs::write(&delta, b"delta").unwrap();

        let report = f.session.add_artifacts("unstable", &[delta]).unwrap();
        assert_eq!(report.deltas_skipped.len(), 1);
        assert!(report.added.is_empty());
        assert!(f.session.database("unstable").unwrap().is_empty());
    }

    #[test]
    fn test_add_conflicting_pool_content_fails() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        f.session.create_repository("stable").unwrap();
        let pkg = package(f.dir.path(), "nano", "nano", 5);
        f.session.add_artifacts("unstable", &[pkg.clone()]).unwrap();

        // Same file name, different bytes
        let mut bytes = fs::read(&pkg).unwrap();
        bytes.push(b' ');
        fs::write(&pkg, bytes).unwrap();

        let result = f.session.add_artifacts("stable", &[pkg]);
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert!(f.session.database("stable").unwrap().is_empty());
    }

    #[test]
    fn test_add_rejects_source_outside_tree() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        let pkg = package(f.dir.path(), "../../escaped", "evil", 1);

        let result = f.session.add_artifacts("unstable", &[pkg.clone()]);
        assert!(matches!(result, Err(Error::MetadataError(_))));
        assert!(!f.dir.path().join("escaped").exists());
        assert!(!f.session.pool().is_pooled(&pkg.file_name().unwrap().to_string_lossy()));
        assert!(f.session.database("unstable").unwrap().is_empty());
    }

    #[test]
    fn test_failed_link_releases_pool_file() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        // A plain file where the shard directory belongs
        fs::write(f.session.layout().repo_dir("unstable").join("n"), b"").unwrap();
        let pkg = package(f.dir.path(), "nano", "nano", 1);

        let result = f.session.add_artifacts("unstable", &[pkg]);
        assert!(matches!(result, Err(Error::IoError(_))));
        assert!(!f.session.pool().is_pooled("nano-1.0-1-1-x86_64.eopkg"));
        assert!(f.session.pool().orphans().unwrap().is_empty());
        assert!(f.session.database("unstable").unwrap().is_empty());
    }

    #[test]
    fn test_remove_sources_unknown_source_and_release() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        f.session
            .add_artifacts("unstable", &[package(f.dir.path(), "nano", "nano", 5)])
            .unwrap();

        let result = f.session.remove_sources("unstable", &["vim".parse().unwrap()]);
        assert!(matches!(result, Err(Error::NotFoundError(_))));

        let result = f.session.remove_sources("unstable", &["nano==4".parse().unwrap()]);
        assert!(matches!(result, Err(Error::NotFoundError(_))));
        assert_eq!(f.session.database("unstable").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_tracks_invalidated_deltas() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        let pkgs = [
            package(f.dir.path(), "nano", "nano", 3),
            package(f.dir.path(), "nano", "nano", 4),
            package(f.dir.path(), "nano", "nano", 5),
        ];
        f.session.add_artifacts("unstable", &pkgs).unwrap();
        f.session.delta("unstable").unwrap();
        assert_eq!(f.generator.calls.borrow().len(), 2);

        f.session.remove_sources("unstable", &["nano==5".parse().unwrap()]).unwrap();
        assert_eq!(f.session.pending_deltas("unstable"), vec!["nano"]);

        let source_dir = f.session.layout().source_dir("unstable", "nano");
        assert!(!source_dir.join("nano-3-5-1-x86_64.delta.eopkg").exists());
        assert!(!f.session.pool().is_pooled("nano-3-5-1-x86_64.delta.eopkg"));

        f.session.finish().unwrap();
        assert!(source_dir.join("nano-3-4-1-x86_64.delta.eopkg").exists());
        assert!(f.session.pending_deltas("unstable").is_empty());
    }

    #[test]
    fn test_delta_prunes_deltas_to_previous_top() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        f.session
            .add_artifacts(
                "unstable",
                &[package(f.dir.path(), "nano", "nano", 3), package(f.dir.path(), "nano", "nano", 4)],
            )
            .unwrap();
        f.session.delta("unstable").unwrap();

        f.session
            .add_artifacts("unstable", &[package(f.dir.path(), "nano", "nano", 5)])
            .unwrap();
        let report = f.session.delta("unstable").unwrap();

        assert_eq!(report.pruned, vec!["nano-3-4-1-x86_64.delta.eopkg".to_string()]);
        assert!(!f.session.pool().is_pooled("nano-3-4-1-x86_64.delta.eopkg"));
        let source_dir = f.session.layout().source_dir("unstable", "nano");
        assert!(source_dir.join("nano-3-5-1-x86_64.delta.eopkg").exists());
        assert!(source_dir.join("nano-4-5-1-x86_64.delta.eopkg").exists());
    }

    #[test]
    fn test_finish_indexes_each_altered_repo_once() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        f.session.create_repository("idle").unwrap();
        f.session
            .add_artifacts("unstable", &[package(f.dir.path(), "nano", "nano", 1)])
            .unwrap();
        f.session
            .add_artifacts("unstable", &[package(f.dir.path(), "zlib", "zlib", 1)])
            .unwrap();

        assert_eq!(f.session.altered(), ["unstable".to_string()]);
        f.session.finish().unwrap();

        let indexed = f.indexer.indexed.borrow();
        assert_eq!(indexed.as_slice(), [f.session.layout().repo_dir("unstable")]);
    }

    #[test]
    fn test_database_is_cached_per_session() {
        let mut f = fixture();
        f.session.create_repository("unstable").unwrap();
        f.session
            .add_artifacts("unstable", &[package(f.dir.path(), "nano", "nano", 1)])
            .unwrap();

        // The on-disk file is not re-read while the session is alive
        fs::write(f.session.layout().db_path("unstable"), b"garbage").unwrap();
        assert_eq!(f.session.database("unstable").unwrap().len(), 1);
    }
}
