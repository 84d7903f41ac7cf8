// src/repository/check.rs

//! Consistency checks
//!
//! The database of a repository must describe exactly the package files
//! linked into its tree, and every linked file must be backed by the pool.

use crate::db::RepoDatabase;
use crate::db::models::Artifact;
use crate::error::{Error, Result};
use crate::packages::is_delta_name;
use crate::pool::{Pool, sha256_file};
use crate::repository::layout::{INDEX_PREFIX, Layout, SENTINEL};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Findings for one repository
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub repository: String,
    /// Recorded artifacts with no file at their target path
    pub missing: Vec<String>,
    /// Recorded artifacts whose file is not a link to the pool copy
    pub unpooled: Vec<String>,
    /// Package files present in the tree but absent from the database
    pub untracked: Vec<PathBuf>,
    /// Delta files not backed by the pool
    pub unbacked_deltas: Vec<PathBuf>,
    /// Artifacts whose content no longer matches the recorded sha256
    pub checksum_mismatches: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.unpooled.is_empty()
            && self.untracked.is_empty()
            && self.unbacked_deltas.is_empty()
            && self.checksum_mismatches.is_empty()
    }
}

/// Compare `db` against the tree of `repo`
pub fn check_repository(
    layout: &Layout,
    pool: &Pool,
    repo: &str,
    db: &RepoDatabase,
    verify_checksums: bool,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport {
        repository: repo.to_string(),
        ..Default::default()
    };

    let mut expected = BTreeSet::new();
    for artifact in db.artifacts() {
        let target = layout.artifact_target(repo, artifact);
        if !target.exists() {
            report.missing.push(artifact.filename.clone());
        } else if !pool.is_linked(&artifact.filename, &target)? {
            report.unpooled.push(artifact.filename.clone());
        }
        expected.insert(target);
    }

    let repo_dir = layout.repo_dir(repo);
    for entry in WalkDir::new(&repo_dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to scan {}: {}", repo_dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 && (name == SENTINEL || name.starts_with(INDEX_PREFIX)) {
            continue;
        }

        let path = entry.path();
        if entry.depth() == 3 && is_delta_name(&name) {
            if !pool.is_linked(&name, path)? {
                report.unbacked_deltas.push(path.to_path_buf());
            }
        } else if !expected.contains(path) {
            report.untracked.push(path.to_path_buf());
        }
    }

    if verify_checksums {
        let recorded: Vec<&Artifact> = db
            .artifacts()
            .filter(|a| a.sha256.is_some() && layout.artifact_target(repo, a).exists())
            .collect();

        let mismatches = recorded
            .par_iter()
            .map(|a| -> Result<Option<String>> {
                let actual = sha256_file(&layout.artifact_target(repo, a))?;
                Ok((a.sha256.as_deref() != Some(actual.as_str())).then(|| a.filename.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        report.checksum_mismatches = mismatches.into_iter().flatten().collect();
    }

    report.untracked.sort();
    report.unbacked_deltas.sort();
    report.checksum_mismatches.sort();
    Ok(report)
}
