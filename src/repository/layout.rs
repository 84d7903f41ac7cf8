// src/repository/layout.rs

//! On-disk layout of the repository tree
//!
//! ```text
//! <base>/pool/<filename>                          pooled files
//! <base>/<repo>/.eopkg-repo                       repository sentinel
//! <base>/<repo>/<shard>/<source>/<filename>       artifact and delta links
//! <base>/<repo>/eopkg-index*                      generated index files
//! <base>/<repo>.db                                repository database
//! <base>/.lock                                    command lock
//! ```

use crate::db::models::Artifact;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Marker file identifying a managed repository
pub const SENTINEL: &str = ".eopkg-repo";

/// Name of the shared pool directory under the base directory
pub const POOL_DIR: &str = "pool";

/// Advisory lock file serializing commands on one base directory
pub const LOCK_FILE: &str = ".lock";

/// Prefix shared by all generated index files
pub const INDEX_PREFIX: &str = "eopkg-index";

/// Shard directory for a source name: `lib` sources use their first four
/// characters, everything else its first character
pub fn shard(source: &str) -> &str {
    let len = if source.starts_with("lib") { 4 } else { 1 };
    match source.char_indices().nth(len) {
        Some((idx, _)) => &source[..idx],
        None => source,
    }
}

/// Resolves every path under a base directory
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base.join(LOCK_FILE)
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.base.join(POOL_DIR)
    }

    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.base.join(repo)
    }

    pub fn sentinel(&self, repo: &str) -> PathBuf {
        self.repo_dir(repo).join(SENTINEL)
    }

    pub fn db_path(&self, repo: &str) -> PathBuf {
        self.base.join(format!("{}.db", repo))
    }

    /// Whether `repo` is a managed repository
    pub fn is_repo(&self, repo: &str) -> bool {
        self.sentinel(repo).exists()
    }

    /// Directory holding every artifact and delta of one source
    pub fn source_dir(&self, repo: &str, source: &str) -> PathBuf {
        self.repo_dir(repo).join(shard(source)).join(source)
    }

    /// Location of `filename` within `repo` for a given source
    pub fn target_path(&self, repo: &str, source: &str, filename: &str) -> PathBuf {
        self.source_dir(repo, source).join(filename)
    }

    pub fn artifact_target(&self, repo: &str, artifact: &Artifact) -> PathBuf {
        self.target_path(repo, &artifact.source_name, &artifact.filename)
    }

    /// Names of all repositories under the base directory, sorted
    ///
    /// A missing base directory means there are no repositories.
    pub fn list_repositories(&self) -> Result<Vec<String>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&self.base).map_err(|e| Error::io("Failed to read", &self.base, e))?;

        let mut repos = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("Failed to read", &self.base, e))?;
            if !entry.path().join(SENTINEL).exists() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => repos.push(name),
                Err(name) => warn!("Ignoring repository with non UTF-8 name: {:?}", name),
            }
        }

        repos.sort();
        Ok(repos)
    }

    /// Reject names that cannot be used as a repository directory
    pub fn validate_repo_name(name: &str) -> Result<()> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains(std::path::MAIN_SEPARATOR)
            || name == POOL_DIR
        {
            return Err(Error::ValidationError(format!(
                "Invalid repository name: '{}'",
                name
            )));
        }
        Ok(())
    }
}
