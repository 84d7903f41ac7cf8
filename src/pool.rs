// src/pool.rs

//! Shared package pool
//!
//! The pool holds exactly one physical copy of every artifact and delta,
//! keyed by file name. Repositories reference pooled files through hardlinks;
//! a pooled file lives as long as at least one repository links it. Reference
//! counts are never cached: garbage collection recomputes them from the
//! repository trees every time.
//!
//! Pool and repositories must share one filesystem for hardlinks to work.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Content pool rooted at `<base>/pool`
#[derive(Debug, Clone)]
pub struct Pool {
    dir: PathBuf,
}

impl Pool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the pool directory if it does not exist yet
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io("Failed to create", &self.dir, e))
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn is_pooled(&self, filename: &str) -> bool {
        self.path_for(filename).exists()
    }

    /// Copy `source` into the pool under `filename`
    ///
    /// The copy lands under a temporary name and is renamed into place, so a
    /// failed copy never leaves a truncated pool file behind.
    pub fn adopt(&self, source: &Path, filename: &str) -> Result<PathBuf> {
        self.ensure_dir()?;

        let dest = self.path_for(filename);
        let tmp = self.dir.join(format!(".{}.tmp", filename));

        info!("Pooling: {}", filename);
        fs::copy(source, &tmp).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::IoError(format!(
                "Unable to pool {} as {}: {}",
                source.display(),
                dest.display(),
                e
            ))
        })?;
        fs::rename(&tmp, &dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io("Unable to pool", &dest, e)
        })?;

        Ok(dest)
    }

    /// Hardlink the pooled `filename` to `target`, creating parent directories
    pub fn link_into(&self, filename: &str, target: &Path) -> Result<()> {
        let pooled = self.path_for(filename);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("Unable to create", parent, e))?;
        }

        fs::hard_link(&pooled, target).map_err(|e| {
            Error::IoError(format!(
                "Unable to link {} from pool to {}: {}",
                filename,
                target.display(),
                e
            ))
        })?;

        debug!("Linked {} -> {}", pooled.display(), target.display());
        Ok(())
    }

    /// Delete the pooled `filename` unless one of `targets` exists
    ///
    /// `targets` are the would-be locations of the file in every known
    /// repository. Returns true if the pool file was removed.
    pub fn garbage_collect<I>(&self, filename: &str, targets: I) -> Result<bool>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        if let Some(user) = targets.into_iter().find(|t| t.exists()) {
            debug!("{} still referenced by {}", filename, user.display());
            return Ok(false);
        }

        let pooled = self.path_for(filename);
        if !pooled.exists() {
            return Ok(false);
        }

        info!("Removing no-longer used pool file: {}", pooled.display());
        fs::remove_file(&pooled).map_err(|e| Error::io("Unable to remove pool file", &pooled, e))?;
        Ok(true)
    }

    /// Whether `path` is the same inode as the pooled `filename`
    pub fn is_linked(&self, filename: &str, path: &Path) -> Result<bool> {
        let pooled = match fs::metadata(self.path_for(filename)) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io("Failed to stat", &self.path_for(filename), e)),
        };
        let linked = fs::metadata(path).map_err(|e| Error::io("Failed to stat", path, e))?;
        Ok(pooled.dev() == linked.dev() && pooled.ino() == linked.ino())
    }

    /// Pooled files that no repository links any more
    pub fn orphans(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io("Failed to read", &self.dir, e))?;
        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("Failed to read", &self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Temporary copies and delta work directories
            if name.starts_with('.') {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| Error::io("Failed to stat", &entry.path(), e))?;
            if meta.is_file() && meta.nlink() <= 1 {
                orphans.push(name);
            }
        }

        orphans.sort();
        Ok(orphans)
    }
}

/// SHA-256 of a file as lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io("Failed to open", path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| Error::io("Failed to read", path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}
