// src/db/mod.rs

//! Repository database
//!
//! Each repository has one database mapping source names to the artifacts
//! present in its tree. It is held in memory for the duration of a command
//! and persisted to `<base>/<repo>.db` as a versioned SQLite file.

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use models::Artifact;
use rusqlite::{Connection, OpenFlags, Transaction, params};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Run `f` inside a transaction, committing only if it succeeds
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// In-memory view of one repository's contents
#[derive(Debug, Clone, Default)]
pub struct RepoDatabase {
    sources: BTreeMap<String, Vec<Artifact>>,
}

impl RepoDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an artifact into its source group
    ///
    /// Returns false (and leaves the database unchanged) if an artifact with
    /// the same identity is already recorded.
    pub fn append(&mut self, artifact: Artifact) -> bool {
        let group = self.sources.entry(artifact.source_name.clone()).or_default();
        if group.iter().any(|a| a.same_identity(&artifact)) {
            warn!("{} is already recorded for {}", artifact.filename, artifact.source_name);
            return false;
        }
        group.push(artifact);
        true
    }

    /// Remove an artifact by identity, dropping its source group once empty
    pub fn remove(&mut self, artifact: &Artifact) -> bool {
        let Some(group) = self.sources.get_mut(&artifact.source_name) else {
            return false;
        };
        let before = group.len();
        group.retain(|a| !a.same_identity(artifact));
        let removed = group.len() != before;
        if group.is_empty() {
            self.sources.remove(&artifact.source_name);
        }
        removed
    }

    pub fn contains(&self, artifact: &Artifact) -> bool {
        self.lookup(&artifact.source_name)
            .is_some_and(|group| group.iter().any(|a| a.same_identity(artifact)))
    }

    pub fn contains_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Artifacts of a source, or `None` if the source is unknown
    pub fn lookup(&self, name: &str) -> Option<&[Artifact]> {
        self.sources.get(name).map(Vec::as_slice)
    }

    /// Artifacts of a source, failing with `NotFoundError` if it is unknown
    pub fn get(&self, name: &str) -> Result<&[Artifact]> {
        self.lookup(name)
            .ok_or_else(|| Error::NotFoundError(format!("No such source: {}", name)))
    }

    /// Source names in sorted order
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.sources.values().flatten()
    }

    /// Number of artifacts across all sources
    pub fn len(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Highest release recorded for a source
    pub fn max_release(&self, name: &str) -> Option<u32> {
        self.lookup(name)?.iter().map(|a| a.release).max()
    }

    /// Every artifact of a source carrying its highest release
    pub fn latest(&self, name: &str) -> Vec<&Artifact> {
        let Some(max) = self.max_release(name) else {
            return Vec::new();
        };
        self.lookup(name)
            .unwrap_or_default()
            .iter()
            .filter(|a| a.release == max)
            .collect()
    }

    /// Load a database from disk
    ///
    /// A missing file yields an empty database. A file that exists but cannot
    /// be read as a repository database is a `PersistenceError`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No database at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let artifacts = read_database(path).map_err(|e| {
            Error::PersistenceError(format!("Unable to load DB file {}: {}", path.display(), e))
        })?;

        let mut db = Self::new();
        for artifact in artifacts {
            db.append(artifact);
        }
        debug!("Loaded {} artifacts from {}", db.len(), path.display());
        Ok(db)
    }

    /// Persist the database to `path`
    ///
    /// The new contents are written to a sibling temporary file and renamed
    /// into place, so a failed save leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("db.tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path).map_err(|e| Error::io("Failed to remove", &tmp_path, e))?;
        }

        if let Err(e) = write_database(self, &tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::PersistenceError(format!(
                "Unable to save DB file {}: {}",
                path.display(),
                e
            )));
        }

        fs::rename(&tmp_path, path).map_err(|e| {
            Error::PersistenceError(format!(
                "Unable to move {} to {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        debug!("Saved {} artifacts to {}", self.len(), path.display());
        Ok(())
    }
}

fn read_database(path: &Path) -> Result<Vec<Artifact>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    match schema::read_schema_version(&conn)? {
        Some(version) if version == schema::SCHEMA_VERSION => {}
        Some(version) => {
            return Err(Error::PersistenceError(format!(
                "unsupported schema version {} (expected {})",
                version,
                schema::SCHEMA_VERSION
            )));
        }
        None => {
            return Err(Error::PersistenceError("missing schema version".to_string()));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT filename, source_name, package_name, version, release, architecture, distribution_release, sha256
         FROM artifacts ORDER BY source_name, release, filename",
    )?;

    let artifacts = stmt
        .query_map([], Artifact::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(artifacts)
}

fn write_database(db: &RepoDatabase, path: &Path) -> Result<()> {
    let mut conn = Connection::open(path)?;
    schema::migrate(&conn)?;

    transaction(&mut conn, |tx| {
        let mut stmt = tx.prepare(
            "INSERT INTO artifacts (filename, source_name, package_name, version, release, architecture, distribution_release, sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for a in db.artifacts() {
            stmt.execute(params![
                &a.filename,
                &a.source_name,
                &a.package_name,
                &a.version,
                a.release,
                &a.architecture,
                &a.distribution_release,
                &a.sha256,
            ])?;
        }

        let repo = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".tmp").trim_end_matches(".db"));
        if let Some(repo) = repo {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('repository', ?1)",
                [repo],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('saved_at', ?1)",
            [chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
}
