// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for pkgpool
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite errors surfaced while reading or writing a repository database
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors without a known path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem failure on a specific path (copy, link, unlink, mkdir, rmdir)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Bad arguments, unknown repositories, duplicate names
    #[error("{0}")]
    ValidationError(String),

    /// Lookup of a repository, source or release that does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Target already exists or a required pool file is missing
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Artifact metadata could not be extracted
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Repository database is corrupt or cannot be written
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Delta generator failed outright
    #[error("Delta error: {0}")]
    DeltaError(String),

    /// Index generation failed
    #[error("Index error: {0}")]
    IndexError(String),

    /// A pooled file differs from the artifact that claims its name
    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl Error {
    /// Build an `IoError` naming the action and offending path
    pub fn io(action: &str, path: &std::path::Path, err: std::io::Error) -> Self {
        Error::IoError(format!("{} {}: {}", action, path.display(), err))
    }
}

/// Result type alias using pkgpool's Error type
pub type Result<T> = std::result::Result<T, Error>;
