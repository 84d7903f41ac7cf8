// src/db/models.rs

//! Data models stored in repository databases
//!
//! An `Artifact` describes one package file present in one repository. Each
//! repository keeps its own descriptor even when the physical file is shared
//! through the pool.

use crate::error::{Error, Result};
use crate::packages::PackageMetadata;
use rusqlite::Row;
use std::fmt;
use std::str::FromStr;

/// Identity of an artifact within a repository database
///
/// Two descriptors are the same logical artifact iff filename, source name
/// and release all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub filename: String,
    pub source_name: String,
    pub release: u32,
}

/// A stored package file and the metadata needed to place it
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub source_name: String,
    pub package_name: String,
    pub version: String,
    pub release: u32,
    pub architecture: String,
    pub distribution_release: String,
    pub sha256: Option<String>,
}

impl Artifact {
    /// Build a descriptor from extracted metadata and the artifact's base name
    ///
    /// Fields that become path components or parts of delta file names must
    /// each be a single non-empty component.
    pub fn from_metadata(meta: PackageMetadata, filename: String) -> Result<Self> {
        check_component("source", &meta.source)?;
        check_component("name", &meta.name)?;
        check_component("architecture", &meta.architecture)?;
        check_component("distribution release", &meta.distribution_release)?;

        Ok(Self {
            filename,
            source_name: meta.source,
            package_name: meta.name,
            version: meta.version,
            release: meta.release,
            architecture: meta.architecture,
            distribution_release: meta.distribution_release,
            sha256: None,
        })
    }

    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            filename: self.filename.clone(),
            source_name: self.source_name.clone(),
            release: self.release,
        }
    }

    /// Whether `other` is the same logical artifact
    pub fn same_identity(&self, other: &Artifact) -> bool {
        self.filename == other.filename
            && self.source_name == other.source_name
            && self.release == other.release
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            filename: row.get(0)?,
            source_name: row.get(1)?,
            package_name: row.get(2)?,
            version: row.get(3)?,
            release: row.get(4)?,
            architecture: row.get(5)?,
            distribution_release: row.get(6)?,
            sha256: row.get(7)?,
        })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.package_name, self.version, self.release)
    }
}

fn check_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains(['/', '\\', '\0'])
    {
        return Err(Error::MetadataError(format!(
            "Invalid package {} '{}'",
            field, value
        )));
    }
    Ok(())
}

/// Source name optionally pinned to one release (`name` or `name==release`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub release: Option<u32>,
}

impl FromStr for SourceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, release) = match s.split_once("==") {
            Some((name, rel)) => {
                let release = rel.parse::<u32>().map_err(|_| {
                    Error::ValidationError(format!("{} is not a valid number", rel))
                })?;
                (name, Some(release))
            }
            None => (s, None),
        };

        if name.is_empty() {
            return Err(Error::ValidationError(format!(
                "Missing source name in '{}'",
                s
            )));
        }

        Ok(Self {
            name: name.to_string(),
            release,
        })
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.release {
            Some(rel) => write!(f, "{}=={}", self.name, rel),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_artifact(source: &str, package: &str, release: u32) -> Artifact {
    Artifact {
        filename: format!("{}-1.0-{}-1-x86_64.eopkg", package, release),
        source_name: source.to_string(),
        package_name: package.to_string(),
        version: "1.0".to_string(),
        release,
        architecture: "x86_64".to_string(),
        distribution_release: "1".to_string(),
        sha256: None,
    }
}
