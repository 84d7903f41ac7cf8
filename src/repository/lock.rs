// src/repository/lock.rs

//! Command lock
//!
//! Commands against one base directory must not interleave. Every mutating
//! run of the binary holds an exclusive advisory lock on `<base>/.lock` from
//! before the session is built until after `finish`.

use crate::error::{Error, Result};
use crate::repository::layout::Layout;
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock on a base directory, released on drop
#[derive(Debug)]
pub struct BaseLock {
    path: PathBuf,
    _file: File,
}

impl BaseLock {
    /// Take the lock without waiting
    ///
    /// Fails with `ConflictError` if another process (or another handle in
    /// this one) already holds it.
    pub fn acquire(layout: &Layout) -> Result<Self> {
        let base = layout.base();
        fs::create_dir_all(base).map_err(|e| Error::io("Unable to create", base, e))?;

        let path = layout.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io("Unable to open lock", &path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(Error::ConflictError(format!(
                    "{} is locked by another command",
                    base.display()
                )));
            }
            Err(e) => return Err(Error::io("Unable to lock", &path, e)),
        }

        debug!("Locked {}", path.display());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("repo"));

        let held = BaseLock::acquire(&layout).unwrap();
        assert_eq!(held.path(), layout.lock_path());
        assert!(layout.lock_path().exists());

        let second = BaseLock::acquire(&layout);
        assert!(matches!(second, Err(Error::ConflictError(_))));

        drop(held);
        assert!(BaseLock::acquire(&layout).is_ok());
    }

    #[test]
    fn test_lock_file_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let _lock = BaseLock::acquire(&layout).unwrap();

        assert!(layout.list_repositories().unwrap().is_empty());
    }
}
