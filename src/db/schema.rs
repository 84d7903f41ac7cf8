// src/db/schema.rs

//! Repository database schema and migrations
//!
//! Every `<repo>.db` file carries its schema version so the format can evolve
//! and a foreign or damaged file is detected instead of silently discarded.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version, creating the tracking table if needed
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    Ok(read_schema_version(conn)?.unwrap_or(0))
}

/// Read the schema version without modifying the database
///
/// Fails if the file is not a SQLite database or has no version table.
pub fn read_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version > SCHEMA_VERSION {
        return Err(Error::PersistenceError(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        debug!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::PersistenceError(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// - meta: repository name and save bookkeeping
/// - artifacts: one row per package file present in the repository
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE artifacts (
            filename TEXT NOT NULL,
            source_name TEXT NOT NULL,
            package_name TEXT NOT NULL,
            version TEXT NOT NULL,
            release INTEGER NOT NULL CHECK(release >= 0),
            architecture TEXT NOT NULL,
            distribution_release TEXT NOT NULL,
            sha256 TEXT,
            PRIMARY KEY (source_name, filename, release)
        );

        CREATE INDEX idx_artifacts_package ON artifacts(source_name, package_name);
        ",
    )?;

    Ok(())
}
