// src/packages/traits.rs

//! Common traits for package metadata extraction

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metadata needed to place and identify a package file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Binary package name
    pub name: String,

    /// Source package the binary was built from
    pub source: String,

    /// Upstream version string
    pub version: String,

    /// Build release counter
    pub release: u32,

    /// Architecture (x86_64, ...)
    pub architecture: String,

    /// Distribution release tag
    pub distribution_release: String,
}

/// Reads package metadata from an artifact file
pub trait MetadataReader {
    /// Extract metadata from the package at `path`
    ///
    /// Fails with `MetadataError` on unreadable or invalid files.
    fn read(&self, path: &Path) -> Result<PackageMetadata>;
}
